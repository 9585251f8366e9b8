//! Playback session
//!
//! Everything one open media source needs. Owned by the looper's handler and
//! touched only on the worker thread.

use crate::backend::MediaBackend;
use crate::codec::DecoderHandle;
use crate::demuxer::{DemuxerHandle, MediaSource, TrackFormat};
use crate::engine::EngineError;
use crate::frame::{FrameGeometry, PixelFormat};
use crate::sink::DisplayTarget;

pub struct Session {
    pub source: MediaSource,
    pub demuxer: DemuxerHandle,
    pub decoder: DecoderHandle,
    pub track_index: usize,
    pub format: TrackFormat,
    /// Layout of decoded frames; follows decoder format changes
    pub geometry: FrameGeometry,
    pub display_target: Option<DisplayTarget>,
    /// Wall-clock anchor of the current segment (`None` = re-anchor on next frame)
    pub render_start: Option<i64>,
    pub saw_input_eos: bool,
    pub saw_output_eos: bool,
    pub is_playing: bool,
    /// Deliver one frame even though not playing
    pub render_once: bool,
    /// A pump round is queued on the looper
    pub pump_scheduled: bool,
    pub failed_rounds: u32,
    /// Frames delivered so far
    pub sequence: u64,
}

impl Session {
    /// Open `source`, select its first video track and start a decoder for it.
    ///
    /// Partially acquired resources are released on every error path.
    pub fn open(source: &MediaSource, backend: &dyn MediaBackend) -> Result<Self, EngineError> {
        let mut demuxer = DemuxerHandle::new(backend.open_demuxer(source).map_err(EngineError::Open)?);
        let Some(d) = demuxer.get_mut() else {
            return Err(EngineError::NoSession);
        };

        let track_count = d.track_count();
        let mut selected = None;
        for index in 0..track_count {
            let Some(format) = d.track_format(index) else {
                tracing::warn!("Track {} has no format", index);
                return Err(EngineError::MissingTrackFormat(index));
            };
            let Some(mime) = format.mime.as_deref() else {
                tracing::warn!("Track {} has no mime type", index);
                return Err(EngineError::MissingMime(index));
            };
            tracing::debug!("Track {}: {}", index, format);
            if mime.starts_with("video/") {
                selected = Some((index, format));
                break;
            }
        }

        let (track_index, format) = selected.ok_or(EngineError::NoVideoTrack(track_count))?;
        d.select_track(track_index).map_err(EngineError::Track)?;

        let mut decoder =
            DecoderHandle::new(backend.create_decoder(&format).map_err(EngineError::Decoder)?);
        decoder.start().map_err(EngineError::Decoder)?;

        let (width, height) = format.dimensions().unwrap_or((0, 0));
        tracing::info!(
            "Opened {}: track {} of {} ({}), decoder {}",
            source,
            track_index,
            track_count,
            format,
            backend.name()
        );

        Ok(Self {
            source: source.clone(),
            demuxer,
            decoder,
            track_index,
            format,
            geometry: FrameGeometry::new(width, height, PixelFormat::Nv12),
            display_target: None,
            render_start: None,
            saw_input_eos: false,
            saw_output_eos: false,
            is_playing: false,
            render_once: false,
            pump_scheduled: false,
            failed_rounds: 0,
            sequence: 0,
        })
    }

    pub fn is_drained(&self) -> bool {
        self.saw_input_eos && self.saw_output_eos
    }

    pub fn is_released(&self) -> bool {
        self.decoder.is_released() && self.demuxer.is_released()
    }

    /// Next frame re-anchors the presentation clock.
    pub fn reset_anchor(&mut self) {
        self.render_start = None;
    }

    /// Replace the display target and size it to the current frame geometry.
    pub fn attach_target(&mut self, target: Option<DisplayTarget>) {
        match &target {
            Some(t) => tracing::debug!("Display target {} attached", t.id()),
            None => tracing::debug!("Display target detached"),
        }
        self.display_target = target;
        self.apply_geometry();
    }

    /// Adopt a new decoder output format.
    pub fn apply_output_format(&mut self, format: &TrackFormat) {
        let (width, height) = format
            .dimensions()
            .unwrap_or((self.geometry.width, self.geometry.height));
        let pixel_format = format.color_format.unwrap_or(self.geometry.format);
        self.geometry = FrameGeometry::new(width, height, pixel_format);
        tracing::debug!("Output format changed: {}", format);
        self.apply_geometry();
    }

    fn apply_geometry(&self) {
        let Some(target) = &self.display_target else {
            return;
        };
        if self.geometry.width == 0 || self.geometry.height == 0 {
            return;
        }
        if let Err(e) = target.surface().set_buffers_geometry(
            self.geometry.width,
            self.geometry.height,
            self.geometry.format,
        ) {
            tracing::warn!("Failed to size display target {}: {}", target.id(), e);
        }
    }

    /// Stop and drop the decoder, close the demuxer, detach the display
    /// target. Returns false if the session was already released.
    pub fn release(&mut self) -> bool {
        let released = self.decoder.release() | self.demuxer.release();
        self.saw_input_eos = true;
        self.saw_output_eos = true;
        self.is_playing = false;
        self.render_once = false;
        self.pump_scheduled = false;
        self.display_target = None;
        if released {
            tracing::info!(
                "Session for {} released after {} frames",
                self.source,
                self.sequence
            );
        }
        released
    }
}
