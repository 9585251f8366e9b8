//! Presentation Clock
//!
//! Maps decoder presentation timestamps onto the wall clock. The only state
//! is the per-segment anchor, which lives in the session and is reset on
//! every resume and seek.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic microsecond time base.
pub trait TimeSource: Send + Sync {
    fn now_us(&self) -> i64;

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Real time, measured from construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }
}

/// Time that only moves when told to. Sleeping advances it.
#[derive(Default)]
pub struct ManualClock {
    now_us: AtomicI64,
}

impl ManualClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now_us
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_us: i64) {
        self.now_us.store(now_us, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Where a frame sits relative to its wall-clock slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTiming {
    pub pts_us: i64,
    /// Positive = ahead of schedule, negative = behind.
    pub delay_us: i64,
    /// This frame established the anchor.
    pub anchored: bool,
}

impl FrameTiming {
    pub fn is_early(&self) -> bool {
        self.delay_us > 0
    }

    pub fn is_late(&self) -> bool {
        self.delay_us < 0
    }
}

/// Compute the timing of a frame, anchoring the segment on its first frame.
///
/// `render_start` is the wall-clock time that corresponds to pts 0 of the
/// current segment; `None` means no frame has been scheduled since the
/// last reset.
pub fn schedule(render_start: &mut Option<i64>, pts_us: i64, now_us: i64) -> FrameTiming {
    let anchored = render_start.is_none();
    let start = *render_start.get_or_insert(now_us - pts_us);

    FrameTiming {
        pts_us,
        delay_us: (start + pts_us) - now_us,
        anchored,
    }
}

// ============================================================================
// Pacing Policy
// ============================================================================

/// Whether early frames are held back until their slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PacingPolicy {
    /// Deliver immediately; the delay is informational only.
    Advisory,
    /// Sleep until the slot, capped at `max_wait_ms` per frame.
    Enforce { max_wait_ms: u64 },
}

impl Default for PacingPolicy {
    fn default() -> Self {
        PacingPolicy::Advisory
    }
}

impl PacingPolicy {
    /// How long to hold a frame before handing it to the sink.
    pub fn hold_for(&self, timing: &FrameTiming) -> Option<Duration> {
        match *self {
            PacingPolicy::Advisory => None,
            PacingPolicy::Enforce { max_wait_ms } => {
                if !timing.is_early() || max_wait_ms == 0 {
                    return None;
                }
                let cap_us = max_wait_ms.saturating_mul(1_000);
                Some(Duration::from_micros((timing.delay_us as u64).min(cap_us)))
            }
        }
    }
}
