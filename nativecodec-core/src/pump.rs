//! Buffer Pump
//!
//! One round = at most one input step and at most one output step, each
//! bounded by a short timeout, so control messages never wait long behind
//! decoding work.
//!
//! ```text
//!   demuxer ──read_sample──► decoder input slot ──queue──►
//!                                                        decoder
//!   sink ◄──deliver── clock::schedule ◄──dequeue output──┘
//! ```

use crate::clock::{self, TimeSource};
use crate::codec::{BufferFlags, CodecError, OutputStatus};
use crate::config::EngineConfig;
use crate::demuxer::{MediaError, SampleFlags};
use crate::frame::VideoFrame;
use crate::session::Session;
use crate::sink::FrameSink;
use crate::status::EngineStatus;
use thiserror::Error;

#[derive(Debug, Error)]
enum PumpError {
    #[error("decoder: {0}")]
    Codec(#[from] CodecError),
    #[error("demuxer: {0}")]
    Media(#[from] MediaError),
    #[error("session already released")]
    Released,
}

/// What the worker should do after a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Schedule another round
    Continue,
    /// Stop pumping until a control message restarts it
    Idle,
    /// Too many consecutive failed rounds; tear the session down
    Failed(String),
}

/// Collaborators a round needs besides the session.
pub struct PumpContext<'a> {
    pub config: &'a EngineConfig,
    pub sink: &'a dyn FrameSink,
    pub clock: &'a dyn TimeSource,
    pub status: &'a EngineStatus,
}

enum Drained {
    Nothing,
    /// `handed_off`: the sink saw the frame, whatever it returned
    Frame { handed_off: bool, delivered: bool },
}

/// Run one pump round against `session`.
pub fn run_round(session: &mut Session, ctx: &PumpContext<'_>) -> PumpOutcome {
    if session.is_released() {
        return PumpOutcome::Idle;
    }

    let mut progressed = false;
    let mut failure = None;

    if !session.saw_input_eos {
        match feed_input(session, ctx) {
            Ok(queued) => progressed |= queued,
            Err(e) => failure = Some(format!("input: {}", e)),
        }
    }

    if !session.saw_output_eos {
        match drain_output(session, ctx) {
            Ok(Drained::Frame { handed_off, .. }) => {
                progressed = true;
                if handed_off {
                    session.render_once = false;
                }
            }
            Ok(Drained::Nothing) => {}
            Err(e) => {
                let msg = format!("output: {}", e);
                failure = Some(match failure {
                    Some(prev) => format!("{}; {}", prev, msg),
                    None => msg,
                });
            }
        }
    }

    if let Some(err) = failure {
        tracing::warn!("Pump round failed: {}", err);
        if !progressed {
            session.failed_rounds += 1;
        }
        let failed_rounds = session.failed_rounds;
        ctx.status.update(|s| {
            s.failed_rounds = failed_rounds;
            s.last_error = Some(err.clone());
        });
        let limit = ctx.config.max_failed_rounds;
        if limit > 0 && failed_rounds >= limit {
            return PumpOutcome::Failed(err);
        }
    } else if progressed && session.failed_rounds > 0 {
        session.failed_rounds = 0;
        ctx.status.update(|s| s.failed_rounds = 0);
    }

    if session.is_drained() {
        tracing::debug!("Input and output drained");
        ctx.status.update(|s| s.drained = true);
        return PumpOutcome::Idle;
    }
    if !(session.is_playing || session.render_once) {
        return PumpOutcome::Idle;
    }
    PumpOutcome::Continue
}

/// Move one compressed sample into the decoder. Returns whether a buffer was queued.
fn feed_input(session: &mut Session, ctx: &PumpContext<'_>) -> Result<bool, PumpError> {
    let decoder = session.decoder.get_mut().ok_or(PumpError::Released)?;
    let demuxer = session.demuxer.get_mut().ok_or(PumpError::Released)?;

    let Some(index) = decoder.dequeue_input_buffer(ctx.config.input_timeout())? else {
        return Ok(false);
    };

    let read = demuxer.read_sample(decoder.input_buffer(index)?);
    match read {
        Ok(Some(size)) => {
            let pts_us = demuxer.sample_time_us().unwrap_or(0);
            let flags = if demuxer.sample_flags().contains(SampleFlags::SYNC) {
                BufferFlags::KEY_FRAME
            } else {
                BufferFlags::empty()
            };
            decoder.queue_input_buffer(index, 0, size, pts_us, flags)?;
            demuxer.advance();
            ctx.status.update(|s| s.samples_queued += 1);
        }
        Ok(None) => {
            decoder.queue_input_buffer(index, 0, 0, 0, BufferFlags::END_OF_STREAM)?;
            session.saw_input_eos = true;
            ctx.status.update(|s| s.input_eos = true);
            tracing::debug!("Input end of stream");
        }
        Err(e) => {
            // Hand the slot back empty so it is not lost.
            if let Err(q) = decoder.queue_input_buffer(index, 0, 0, 0, BufferFlags::empty()) {
                tracing::debug!("Could not return input slot {}: {}", index, q);
            }
            return Err(e.into());
        }
    }
    Ok(true)
}

/// Take at most one decoder output and hand it to the sink.
fn drain_output(session: &mut Session, ctx: &PumpContext<'_>) -> Result<Drained, PumpError> {
    let decoder = session.decoder.get_mut().ok_or(PumpError::Released)?;

    let (index, info) = match decoder.dequeue_output_buffer(ctx.config.output_timeout())? {
        OutputStatus::Ready { index, info } => (index, info),
        OutputStatus::FormatChanged => {
            let format = decoder.output_format();
            session.apply_output_format(&format);
            let geometry = session.geometry;
            ctx.status.update(|s| {
                s.width = geometry.width;
                s.height = geometry.height;
            });
            return Ok(Drained::Nothing);
        }
        OutputStatus::BuffersChanged => {
            tracing::debug!("Output buffers changed");
            return Ok(Drained::Nothing);
        }
        OutputStatus::TryAgainLater => return Ok(Drained::Nothing),
    };

    let eos = info.is_end_of_stream();
    let mut handed_off = false;
    let mut delivered = false;
    let mut sink_error = None;
    let mut timing = None;
    let mut sink_us = None;

    if info.size > 0 {
        let frame_timing = clock::schedule(&mut session.render_start, info.pts_us, ctx.clock.now_us());
        if let Some(hold) = ctx.config.pacing.hold_for(&frame_timing) {
            ctx.clock.sleep(hold);
        }
        timing = Some(frame_timing);

        match decoder.output_buffer(index) {
            Ok(data) => {
                let frame = VideoFrame {
                    data,
                    geometry: session.geometry,
                    pts_us: info.pts_us,
                    timing: frame_timing,
                    sequence: session.sequence,
                    end_of_stream: eos,
                };
                let started = ctx.clock.now_us();
                handed_off = true;
                match ctx.sink.deliver(&frame, session.display_target.as_ref()) {
                    Ok(()) => delivered = true,
                    Err(e) => sink_error = Some(e.to_string()),
                }
                sink_us = Some((ctx.clock.now_us() - started).max(0) as u64);
            }
            Err(e) => sink_error = Some(e.to_string()),
        }
    }

    // Exactly one release per dequeued index, whatever happened above.
    let released = decoder.release_output_buffer(index, delivered);

    if delivered {
        session.sequence += 1;
    }
    if eos {
        session.saw_output_eos = true;
        tracing::debug!("Output end of stream");
    }
    if let Some(t) = &timing {
        tracing::debug!(
            "pts={}us delay={}us{}",
            t.pts_us,
            t.delay_us,
            if t.anchored { " (anchor)" } else { "" }
        );
    }
    if let Some(e) = &sink_error {
        tracing::warn!("Sink rejected frame pts={}: {}", info.pts_us, e);
    }

    ctx.status.update(|s| {
        if released.is_ok() {
            s.buffers_released += 1;
        }
        if delivered {
            s.frames_delivered += 1;
        }
        if sink_error.is_some() {
            s.sink_errors += 1;
        }
        if let Some(t) = timing {
            s.last_pts_us = Some(t.pts_us);
            s.last_delay_us = Some(t.delay_us);
            if t.is_late() {
                s.late_frames += 1;
            }
        }
        if sink_us.is_some() {
            s.last_sink_us = sink_us;
        }
        s.output_eos |= eos;
    });

    released?;
    Ok(Drained::Frame {
        handed_off,
        delivered,
    })
}
