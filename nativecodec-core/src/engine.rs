//! # Playback Engine
//!
//! Control surface plus the looper worker that owns the session.
//!
//! ```text
//!  control thread(s)                       worker thread ("nativecodec-looper")
//!  ─────────────────                       ────────────────────────────────────
//!  create() ── opens Session ─────────────► Worker { session }
//!  resume()/pause()/seek() ── post ───────► handle(Message)
//!  set_display_target()    ── post ───────►   ├─ BufferReady → pump::run_round
//!  shutdown() ── post_flush(Done) + join ─►   └─ re-posts BufferReady while
//!                                                playing or previewing
//! ```
//!
//! Only the worker touches the session. Control threads see state through
//! the shared [`EngineStatus`].

use crate::backend::MediaBackend;
use crate::clock::{MonotonicClock, TimeSource};
use crate::codec::CodecError;
use crate::config::EngineConfig;
use crate::demuxer::{MediaError, MediaSource, SeekMode};
use crate::looper::{Handler, Looper, LooperError, LooperHandle, Task};
use crate::pump::{self, PumpContext, PumpOutcome};
use crate::session::Session;
use crate::sink::{DisplayTarget, FrameSink};
use crate::status::{EngineStats, EngineStatus, PlaybackState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to open source: {0}")]
    Open(#[source] MediaError),
    #[error("Track {0} has no format")]
    MissingTrackFormat(usize),
    #[error("Track {0} has no mime type")]
    MissingMime(usize),
    #[error("No video track among {0} track(s)")]
    NoVideoTrack(usize),
    #[error("Failed to select track: {0}")]
    Track(#[source] MediaError),
    #[error("Decoder setup failed: {0}")]
    Decoder(#[source] CodecError),
    #[error("Worker error: {0}")]
    Looper(#[from] LooperError),
    #[error("No active session")]
    NoSession,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug)]
pub enum Message {
    /// Run one pump round
    BufferReady,
    Pause,
    Resume,
    /// Posted behind a pause barrier once queued pump rounds are gone
    PauseAck,
    Seek { position_us: i64 },
    SetDisplayTarget(Option<DisplayTarget>),
    /// Tear the session down
    Done,
}

impl Task for Message {
    fn discardable(&self) -> bool {
        matches!(self, Message::BufferReady)
    }
}

// ============================================================================
// Worker (looper thread)
// ============================================================================

struct Worker {
    session: Session,
    config: EngineConfig,
    sink: Arc<dyn FrameSink>,
    clock: Arc<dyn TimeSource>,
    status: Arc<EngineStatus>,
}

impl Worker {
    fn schedule_pump(&mut self, looper: &LooperHandle<Message>) {
        if self.session.pump_scheduled || self.session.is_released() {
            return;
        }
        match looper.post(Message::BufferReady) {
            Ok(()) => {
                self.session.pump_scheduled = true;
                self.status.update(|s| s.pumping = true);
            }
            Err(e) => tracing::debug!("Pump not scheduled: {}", e),
        }
    }

    fn stop_pumping(&mut self) {
        self.session.pump_scheduled = false;
        self.status.update(|s| s.pumping = false);
    }

    fn on_buffer_ready(&mut self, looper: &LooperHandle<Message>) {
        self.session.pump_scheduled = false;

        let ctx = PumpContext {
            config: &self.config,
            sink: self.sink.as_ref(),
            clock: self.clock.as_ref(),
            status: &self.status,
        };
        match pump::run_round(&mut self.session, &ctx) {
            PumpOutcome::Continue => self.schedule_pump(looper),
            PumpOutcome::Idle => self.stop_pumping(),
            PumpOutcome::Failed(err) => {
                tracing::error!(
                    "Giving up after {} failed pump rounds: {}",
                    self.session.failed_rounds,
                    err
                );
                self.teardown();
            }
        }
    }

    fn on_resume(&mut self, looper: &LooperHandle<Message>) {
        if self.session.is_released() || self.session.is_playing {
            return;
        }
        self.session.is_playing = true;
        self.session.reset_anchor();
        self.status.set_state(PlaybackState::Playing);
        tracing::debug!("Playing");
        self.schedule_pump(looper);
    }

    fn on_pause(&mut self, looper: &LooperHandle<Message>) {
        if self.session.is_released() || !self.session.is_playing {
            return;
        }
        self.session.is_playing = false;
        // The barrier below also drops a pending preview round.
        self.session.render_once = false;
        self.status.set_state(PlaybackState::Paused);
        tracing::debug!("Paused");
        // The barrier drops any queued pump round.
        if let Err(e) = looper.post_flush(Message::PauseAck) {
            tracing::debug!("Pause barrier not posted: {}", e);
        }
        self.stop_pumping();
    }

    fn on_seek(&mut self, position_us: i64, looper: &LooperHandle<Message>) {
        if self.session.is_released() {
            tracing::debug!("Seek ignored, session released");
            return;
        }

        let mut error = None;
        if let Some(demuxer) = self.session.demuxer.get_mut() {
            if let Err(e) = demuxer.seek_to(position_us, SeekMode::PreviousSync) {
                error = Some(format!("seek: {}", e));
            }
        }
        if let Some(decoder) = self.session.decoder.get_mut() {
            if let Err(e) = decoder.flush() {
                error = Some(format!("flush: {}", e));
            }
        }
        if let Some(err) = &error {
            tracing::warn!("Seek to {}us incomplete: {}", position_us, err);
        }

        let session = &mut self.session;
        session.saw_input_eos = false;
        session.saw_output_eos = false;
        session.failed_rounds = 0;
        session.reset_anchor();
        if !session.is_playing {
            session.render_once = true;
        }
        let state = if session.is_playing {
            PlaybackState::Playing
        } else {
            PlaybackState::Ready
        };

        self.status.update(|s| {
            s.seeks += 1;
            s.state = state;
            s.input_eos = false;
            s.output_eos = false;
            s.drained = false;
            s.failed_rounds = 0;
            if error.is_some() {
                s.last_error = error.clone();
            }
        });
        tracing::debug!("Seeked to {}us", position_us);
        self.schedule_pump(looper);
    }

    fn teardown(&mut self) {
        self.session.release();
        self.status.update(|s| {
            s.state = PlaybackState::Done;
            s.pumping = false;
        });
    }
}

impl Handler<Message> for Worker {
    fn handle(&mut self, message: Message, looper: &LooperHandle<Message>) {
        match message {
            Message::BufferReady => self.on_buffer_ready(looper),
            Message::Resume => self.on_resume(looper),
            Message::Pause => self.on_pause(looper),
            Message::PauseAck => {
                self.status.update(|s| s.pause_acks += 1);
                tracing::debug!("Pause acknowledged");
            }
            Message::Seek { position_us } => self.on_seek(position_us, looper),
            Message::SetDisplayTarget(target) => {
                if !self.session.is_released() {
                    self.session.attach_target(target);
                }
            }
            Message::Done => {
                tracing::debug!("Done received");
                self.teardown();
            }
        }
    }

    fn on_exit(&mut self) {
        if self.session.release() {
            self.status.update(|s| {
                s.state = PlaybackState::Done;
                s.pumping = false;
            });
        }
    }
}

// ============================================================================
// Controller (any thread)
// ============================================================================

/// Cloneable control handle for a running session.
///
/// Calls never block on decoding. Once the session is gone they do nothing.
#[derive(Clone)]
pub struct PlaybackController {
    looper: LooperHandle<Message>,
    status: Arc<EngineStatus>,
}

impl PlaybackController {
    fn post(&self, message: Message) {
        if let Err(e) = self.looper.post(message) {
            tracing::debug!("Control message dropped: {}", e);
        }
    }

    pub fn set_playing(&self, playing: bool) {
        if playing {
            self.resume();
        } else {
            self.pause();
        }
    }

    pub fn resume(&self) {
        self.post(Message::Resume);
    }

    pub fn pause(&self) {
        self.post(Message::Pause);
    }

    pub fn seek(&self, position_us: i64) {
        self.status.update(|s| {
            if s.state.has_session() {
                s.state = PlaybackState::SeekPending;
            }
        });
        self.post(Message::Seek { position_us });
    }

    pub fn seek_to_start(&self) {
        self.seek(0);
    }

    pub fn set_display_target(&self, target: Option<DisplayTarget>) {
        self.post(Message::SetDisplayTarget(target));
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn stats(&self) -> EngineStats {
        self.status.snapshot()
    }

    pub fn wait_until(&self, timeout: Duration, pred: impl FnMut(&EngineStats) -> bool) -> bool {
        self.status.wait_until(timeout, pred)
    }
}

// ============================================================================
// Engine (owner)
// ============================================================================

pub struct PlaybackEngine {
    config: EngineConfig,
    backend: Arc<dyn MediaBackend>,
    sink: Arc<dyn FrameSink>,
    clock: Arc<dyn TimeSource>,
    status: Arc<EngineStatus>,
    display_target: Mutex<Option<DisplayTarget>>,
    looper: Option<Looper<Message>>,
}

impl PlaybackEngine {
    pub fn new(config: EngineConfig, backend: Arc<dyn MediaBackend>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            config,
            backend,
            sink,
            clock: Arc::new(MonotonicClock::new()),
            status: Arc::new(EngineStatus::new()),
            display_target: Mutex::new(None),
            looper: None,
        }
    }

    /// Replace the time source used by the presentation clock.
    pub fn with_time_source(mut self, clock: Arc<dyn TimeSource>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open `source` and start a worker for it.
    ///
    /// A running session is shut down first. On error nothing stays open
    /// and the state is unchanged.
    pub fn create(&mut self, source: &MediaSource) -> Result<(), EngineError> {
        if self.looper.is_some() {
            tracing::info!("Replacing running session");
            self.shutdown();
        }

        let mut session = match Session::open(source, self.backend.as_ref()) {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("Failed to create session for {}: {}", source, e);
                return Err(e);
            }
        };
        session.render_once = self.config.preview_on_create;
        session.pump_scheduled = true;
        if let Some(target) = self.display_target.lock().clone() {
            session.attach_target(Some(target));
        }
        let (width, height) = (session.geometry.width, session.geometry.height);

        let worker = Worker {
            session,
            config: self.config.clone(),
            sink: self.sink.clone(),
            clock: self.clock.clone(),
            status: self.status.clone(),
        };
        let looper = Looper::spawn(self.config.worker_name.clone(), worker)?;

        self.status.begin_session(source.to_string(), width, height);
        self.status.update(|s| s.pumping = true);
        looper.post(Message::BufferReady)?;
        self.looper = Some(looper);
        tracing::info!("Session created for {}", source);
        Ok(())
    }

    /// Control handle for the current session, if any.
    pub fn controller(&self) -> Option<PlaybackController> {
        self.looper.as_ref().map(|looper| PlaybackController {
            looper: looper.handle(),
            status: self.status.clone(),
        })
    }

    /// Remember `target` for this and future sessions and hand it to the worker.
    pub fn set_display_target(&self, target: Option<DisplayTarget>) {
        *self.display_target.lock() = target.clone();
        if let Some(controller) = self.controller() {
            controller.set_display_target(target);
        }
    }

    pub fn set_playing(&self, playing: bool) {
        match self.controller() {
            Some(controller) => controller.set_playing(playing),
            None => tracing::debug!("set_playing({}) without a session", playing),
        }
    }

    pub fn resume(&self) {
        self.set_playing(true);
    }

    pub fn pause(&self) {
        self.set_playing(false);
    }

    pub fn seek(&self, position_us: i64) {
        match self.controller() {
            Some(controller) => controller.seek(position_us),
            None => tracing::debug!("seek({}) without a session", position_us),
        }
    }

    pub fn seek_to_start(&self) {
        self.seek(0);
    }

    /// Tear the session down and join the worker. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        let Some(looper) = self.looper.take() else {
            return;
        };
        if let Err(e) = looper.post_flush(Message::Done) {
            tracing::debug!("Done not posted: {}", e);
        }
        looper.quit();
        *self.display_target.lock() = None;
        self.status.update(|s| {
            s.state = PlaybackState::Done;
            s.pumping = false;
        });
        tracing::info!("Session shut down");
    }

    pub fn state(&self) -> PlaybackState {
        self.status.state()
    }

    pub fn stats(&self) -> EngineStats {
        self.status.snapshot()
    }

    pub fn status(&self) -> Arc<EngineStatus> {
        self.status.clone()
    }

    pub fn wait_until(&self, timeout: Duration, pred: impl FnMut(&EngineStats) -> bool) -> bool {
        self.status.wait_until(timeout, pred)
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
