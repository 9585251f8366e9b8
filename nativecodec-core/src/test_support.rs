//! Instrumented collaborators for engine tests.
//!
//! Wraps the reference backend so tests can count resource releases, inject
//! faults and inspect every delivered frame.

use crate::backend::{MediaBackend, ReferenceBackend};
use crate::codec::{BufferFlags, CodecError, Decoder, OutputStatus};
use crate::demuxer::{Demuxer, MediaError, MediaSource, SampleFlags, SeekMode, TrackFormat};
use crate::frame::VideoFrame;
use crate::sink::{DisplayTarget, FrameSink, SinkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub struct Counters {
    pub demuxers_opened: AtomicUsize,
    pub demuxer_closes: AtomicUsize,
    pub decoders_created: AtomicUsize,
    pub decoder_stops: AtomicUsize,
    pub decoder_drops: AtomicUsize,
    pub flushes: AtomicUsize,
    pub seeks: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    /// First track reports no mime type
    MissingMime,
    /// Only an audio track
    AudioOnly,
    /// First track has no format at all
    UndescribedTrack,
    /// Backend refuses to create a decoder
    DecoderRejected,
    /// Decoder is created but fails to start
    StartFails,
    /// Every dequeue fails
    Broken,
}

// ============================================================================
// Demuxer / Decoder wrappers
// ============================================================================

struct CountedDemuxer {
    inner: Box<dyn Demuxer>,
    tracks: Option<Vec<Option<TrackFormat>>>,
    counters: Arc<Counters>,
}

impl Demuxer for CountedDemuxer {
    fn track_count(&self) -> usize {
        match &self.tracks {
            Some(tracks) => tracks.len(),
            None => self.inner.track_count(),
        }
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        match &self.tracks {
            Some(tracks) => tracks.get(index).cloned().flatten(),
            None => self.inner.track_format(index),
        }
    }

    fn select_track(&mut self, index: usize) -> Result<(), MediaError> {
        self.inner.select_track(index)
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        self.inner.read_sample(buf)
    }

    fn sample_time_us(&self) -> Option<i64> {
        self.inner.sample_time_us()
    }

    fn sample_flags(&self) -> SampleFlags {
        self.inner.sample_flags()
    }

    fn advance(&mut self) -> bool {
        self.inner.advance()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<(), MediaError> {
        Counters::bump(&self.counters.seeks);
        self.inner.seek_to(time_us, mode)
    }

    fn close(&mut self) {
        Counters::bump(&self.counters.demuxer_closes);
        self.inner.close();
    }
}

struct CountedDecoder {
    inner: Box<dyn Decoder>,
    counters: Arc<Counters>,
}

impl Decoder for CountedDecoder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn start(&mut self) -> Result<(), CodecError> {
        self.inner.start()
    }

    fn dequeue_input_buffer(&mut self, timeout: Duration) -> Result<Option<usize>, CodecError> {
        self.inner.dequeue_input_buffer(timeout)
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        self.inner.input_buffer(index)
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        self.inner.queue_input_buffer(index, offset, size, pts_us, flags)
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> Result<OutputStatus, CodecError> {
        self.inner.dequeue_output_buffer(timeout)
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8], CodecError> {
        self.inner.output_buffer(index)
    }

    fn output_format(&self) -> TrackFormat {
        self.inner.output_format()
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> Result<(), CodecError> {
        self.inner.release_output_buffer(index, render)
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        Counters::bump(&self.counters.flushes);
        self.inner.flush()
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        Counters::bump(&self.counters.decoder_stops);
        self.inner.stop()
    }
}

impl Drop for CountedDecoder {
    fn drop(&mut self) {
        Counters::bump(&self.counters.decoder_drops);
    }
}

/// Decoder that starts (or not) and then fails every call.
struct FaultyDecoder {
    start_fails: bool,
}

impl FaultyDecoder {
    fn fail<T>() -> Result<T, CodecError> {
        Err(CodecError::Failed("injected fault".to_string()))
    }
}

impl Decoder for FaultyDecoder {
    fn name(&self) -> &str {
        "faulty"
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.start_fails {
            return Self::fail();
        }
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _: Duration) -> Result<Option<usize>, CodecError> {
        Self::fail()
    }

    fn input_buffer(&mut self, _: usize) -> Result<&mut [u8], CodecError> {
        Self::fail()
    }

    fn queue_input_buffer(
        &mut self,
        _: usize,
        _: usize,
        _: usize,
        _: i64,
        _: BufferFlags,
    ) -> Result<(), CodecError> {
        Self::fail()
    }

    fn dequeue_output_buffer(&mut self, _: Duration) -> Result<OutputStatus, CodecError> {
        Self::fail()
    }

    fn output_buffer(&self, _: usize) -> Result<&[u8], CodecError> {
        Self::fail()
    }

    fn output_format(&self) -> TrackFormat {
        TrackFormat::default()
    }

    fn release_output_buffer(&mut self, _: usize, _: bool) -> Result<(), CodecError> {
        Self::fail()
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        Ok(())
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct TestBackend {
    inner: ReferenceBackend,
    fault: Fault,
    pub counters: Arc<Counters>,
}

impl TestBackend {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: ReferenceBackend::default(),
            fault,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl MediaBackend for TestBackend {
    fn name(&self) -> &str {
        "test"
    }

    fn open_demuxer(&self, source: &MediaSource) -> Result<Box<dyn Demuxer>, MediaError> {
        let inner = self.inner.open_demuxer(source)?;
        Counters::bump(&self.counters.demuxers_opened);

        let tracks = match self.fault {
            Fault::MissingMime => Some(vec![Some(TrackFormat::default()), inner.track_format(0)]),
            Fault::AudioOnly => Some(vec![Some(TrackFormat::audio("audio/raw", 48_000, 2))]),
            Fault::UndescribedTrack => Some(vec![None, inner.track_format(0)]),
            _ => None,
        };

        Ok(Box::new(CountedDemuxer {
            inner,
            tracks,
            counters: self.counters.clone(),
        }))
    }

    fn create_decoder(&self, format: &TrackFormat) -> Result<Box<dyn Decoder>, CodecError> {
        let inner: Box<dyn Decoder> = match self.fault {
            Fault::DecoderRejected => {
                return Err(CodecError::UnsupportedMime(
                    format.mime.clone().unwrap_or_default(),
                ))
            }
            Fault::StartFails => Box::new(FaultyDecoder { start_fails: true }),
            Fault::Broken => Box::new(FaultyDecoder { start_fails: false }),
            _ => self.inner.create_decoder(format)?,
        };
        Counters::bump(&self.counters.decoders_created);
        Ok(Box::new(CountedDecoder {
            inner,
            counters: self.counters.clone(),
        }))
    }
}

// ============================================================================
// Sink
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub pts_us: i64,
    pub delay_us: i64,
    pub anchored: bool,
    pub width: u32,
    pub height: u32,
    pub bytes: usize,
    pub target: Option<u64>,
}

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<Delivered>>,
}

impl RecordingSink {
    pub fn frames(&self) -> Vec<Delivered> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }
}

impl FrameSink for RecordingSink {
    fn deliver(
        &self,
        frame: &VideoFrame<'_>,
        target: Option<&DisplayTarget>,
    ) -> Result<(), SinkError> {
        self.frames.lock().push(Delivered {
            pts_us: frame.pts_us,
            delay_us: frame.timing.delay_us,
            anchored: frame.timing.anchored,
            width: frame.width(),
            height: frame.height(),
            bytes: frame.data.len(),
            target: target.map(|t| t.id()),
        });
        Ok(())
    }
}

/// Sink that refuses every frame.
#[derive(Default)]
pub struct RejectingSink {
    calls: AtomicUsize,
}

impl RejectingSink {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FrameSink for RejectingSink {
    fn deliver(&self, frame: &VideoFrame<'_>, _: Option<&DisplayTarget>) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Rejected(format!("pts {}", frame.pts_us)))
    }
}
