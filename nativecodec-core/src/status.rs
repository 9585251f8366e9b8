//! Observable engine state
//!
//! The worker thread publishes state and counters here after every handled
//! message; control threads read snapshots or block until a condition holds.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No session
    #[default]
    Idle,
    /// Session open, not playing
    Ready,
    Playing,
    Paused,
    /// Seek posted, not yet handled
    SeekPending,
    /// Session torn down
    Done,
}

impl PlaybackState {
    pub fn has_session(&self) -> bool {
        !matches!(self, Self::Idle | Self::Done)
    }
}

/// Snapshot of engine counters. Counters restart with every session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub state: PlaybackState,
    pub source: Option<String>,
    pub width: u32,
    pub height: u32,
    pub samples_queued: u64,
    pub frames_delivered: u64,
    pub buffers_released: u64,
    pub sink_errors: u64,
    pub pause_acks: u64,
    pub seeks: u64,
    pub failed_rounds: u32,
    pub last_pts_us: Option<i64>,
    pub last_delay_us: Option<i64>,
    /// Time spent inside the sink for the last frame
    pub last_sink_us: Option<u64>,
    pub late_frames: u64,
    pub input_eos: bool,
    pub output_eos: bool,
    /// Both ends have reached end of stream
    pub drained: bool,
    /// A pump round is scheduled
    pub pumping: bool,
    pub last_error: Option<String>,
}

pub struct EngineStatus {
    stats: Mutex<EngineStats>,
    changed: Condvar,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(EngineStats::default()),
            changed: Condvar::new(),
        }
    }

    pub fn snapshot(&self) -> EngineStats {
        self.stats.lock().clone()
    }

    pub fn state(&self) -> PlaybackState {
        self.stats.lock().state
    }

    /// Mutate under the lock and wake waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut EngineStats) -> R) -> R {
        let result = f(&mut self.stats.lock());
        self.changed.notify_all();
        result
    }

    pub fn set_state(&self, state: PlaybackState) {
        self.update(|s| s.state = state);
    }

    /// Fresh counters for a new session.
    pub fn begin_session(&self, source: String, width: u32, height: u32) {
        self.update(|s| {
            *s = EngineStats {
                state: PlaybackState::Ready,
                source: Some(source),
                width,
                height,
                ..Default::default()
            }
        });
    }

    /// Block until `pred` holds or `timeout` elapses. Returns whether it held.
    pub fn wait_until(&self, timeout: Duration, mut pred: impl FnMut(&EngineStats) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stats = self.stats.lock();
        while !pred(&stats) {
            if self.changed.wait_until(&mut stats, deadline).timed_out() {
                return pred(&stats);
            }
        }
        true
    }
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_begin_session_resets_counters() {
        let status = EngineStatus::new();
        status.update(|s| {
            s.frames_delivered = 12;
            s.last_error = Some("stale".into());
        });

        status.begin_session("synthetic:".into(), 640, 360);
        let stats = status.snapshot();
        assert_eq!(stats.state, PlaybackState::Ready);
        assert_eq!(stats.frames_delivered, 0);
        assert_eq!(stats.last_error, None);
        assert_eq!((stats.width, stats.height), (640, 360));
    }

    #[test]
    fn test_wait_until_wakes_on_update() {
        let status = Arc::new(EngineStatus::new());
        let writer = status.clone();
        let worker = thread::spawn(move || {
            for _ in 0..5 {
                thread::sleep(Duration::from_millis(2));
                writer.update(|s| s.frames_delivered += 1);
            }
        });

        assert!(status.wait_until(Duration::from_secs(5), |s| s.frames_delivered == 5));
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_until_times_out() {
        let status = EngineStatus::new();
        assert!(!status.wait_until(Duration::from_millis(10), |s| s.pumping));
    }

    #[test]
    fn test_stats_json() {
        let json = serde_json::to_value(EngineStats::default()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["frames_delivered"], 0);
    }
}
