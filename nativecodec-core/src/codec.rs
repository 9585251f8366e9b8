//! Decoder interface
//!
//! Buffer-index protocol: the caller dequeues an input slot, fills it, and
//! queues it back; decoded output is dequeued by index, read, and released.
//! Every dequeued output index must be released exactly once.

use crate::demuxer::TrackFormat;
use bitflags::bitflags;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("No decoder for mime type {0}")]
    UnsupportedMime(String),
    #[error("Decoder configuration failed: {0}")]
    Configure(String),
    #[error("Decoder is not started")]
    NotStarted,
    #[error("Invalid buffer index {0}")]
    InvalidIndex(usize),
    #[error("Input of {size} bytes does not fit buffer of {capacity}")]
    Overflow { size: usize, capacity: usize },
    #[error("Input queued after end of stream")]
    InputAfterEos,
    #[error("Decoder failure: {0}")]
    Failed(String),
}

bitflags! {
    /// Flags carried by input and output buffers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        const KEY_FRAME = 1;
        const CODEC_CONFIG = 2;
        const END_OF_STREAM = 4;
    }
}

/// Metadata of a dequeued output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub offset: usize,
    pub size: usize,
    pub pts_us: i64,
    pub flags: BufferFlags,
}

impl BufferInfo {
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(BufferFlags::END_OF_STREAM)
    }
}

/// Result of one output dequeue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    Ready { index: usize, info: BufferInfo },
    /// New output format available via `output_format`
    FormatChanged,
    /// Output buffer set was reallocated
    BuffersChanged,
    TryAgainLater,
}

pub trait Decoder: Send {
    fn name(&self) -> &str;

    fn start(&mut self) -> Result<(), CodecError>;

    /// Slot index for the next input sample, or `None` if none frees up
    /// within `timeout`.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError>;

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError>;

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError>;

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputStatus, CodecError>;

    /// Payload of a dequeued output buffer (`info.offset..info.offset + info.size`)
    fn output_buffer(&self, index: usize) -> Result<&[u8], CodecError>;

    fn output_format(&self) -> TrackFormat;

    /// Return an output buffer; `render` asks for it to be shown on the surface.
    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError>;

    /// Discard queued input and pending output; owned buffer indices become invalid.
    fn flush(&mut self) -> Result<(), CodecError>;

    fn stop(&mut self) -> Result<(), CodecError>;
}

/// Owns a decoder; stops it (if started) and drops it exactly once.
pub struct DecoderHandle {
    inner: Option<Box<dyn Decoder>>,
    started: bool,
}

impl DecoderHandle {
    pub fn new(decoder: Box<dyn Decoder>) -> Self {
        Self {
            inner: Some(decoder),
            started: false,
        }
    }

    pub fn start(&mut self) -> Result<(), CodecError> {
        let decoder = self.inner.as_deref_mut().ok_or(CodecError::NotStarted)?;
        decoder.start()?;
        self.started = true;
        Ok(())
    }

    pub fn get_mut(&mut self) -> Option<&mut (dyn Decoder + 'static)> {
        self.inner.as_deref_mut()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    pub fn release(&mut self) -> bool {
        let Some(mut decoder) = self.inner.take() else {
            return false;
        };
        if self.started {
            if let Err(e) = decoder.stop() {
                tracing::warn!("Decoder {} stop failed: {}", decoder.name(), e);
            }
            self.started = false;
        }
        tracing::debug!("Decoder {} released", decoder.name());
        true
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.release();
    }
}
