//! Frame sinks and display targets
//!
//! The sink receives each decoded frame on the worker thread together with
//! the session's display target. Implementations must not block for long;
//! the pump round waits on them.

use crate::frame::{PixelFormat, VideoFrame};
use parking_lot::Mutex;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame rejected: {0}")]
    Rejected(String),
}

// ============================================================================
// Display Targets
// ============================================================================

/// Something frames can be presented on.
pub trait DisplaySurface: Send + Sync {
    fn id(&self) -> u64;

    /// Resize the surface's buffer queue to the decoded frame geometry.
    fn set_buffers_geometry(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), SinkError>;
}

/// Shared reference to a display surface, held by at most one session.
#[derive(Clone)]
pub struct DisplayTarget(Arc<dyn DisplaySurface>);

impl DisplayTarget {
    pub fn new(surface: Arc<dyn DisplaySurface>) -> Self {
        Self(surface)
    }

    pub fn id(&self) -> u64 {
        self.0.id()
    }

    pub fn surface(&self) -> &dyn DisplaySurface {
        self.0.as_ref()
    }
}

impl fmt::Debug for DisplayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DisplayTarget").field(&self.id()).finish()
    }
}

/// Surface without a window. Remembers the last geometry it was given.
pub struct HeadlessSurface {
    id: u64,
    geometry: Mutex<Option<(u32, u32, PixelFormat)>>,
}

impl HeadlessSurface {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            geometry: Mutex::new(None),
        }
    }

    pub fn geometry(&self) -> Option<(u32, u32, PixelFormat)> {
        *self.geometry.lock()
    }
}

impl DisplaySurface for HeadlessSurface {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_buffers_geometry(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<(), SinkError> {
        *self.geometry.lock() = Some((width, height, format));
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

pub trait FrameSink: Send + Sync {
    fn deliver(
        &self,
        frame: &VideoFrame<'_>,
        target: Option<&DisplayTarget>,
    ) -> Result<(), SinkError>;
}

/// Accepts and forgets.
pub struct NullSink;

impl FrameSink for NullSink {
    fn deliver(&self, _: &VideoFrame<'_>, _: Option<&DisplayTarget>) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Counts frames and tracks schedule slip.
pub struct StatsSink {
    frames: AtomicU64,
    bytes: AtomicU64,
    late_frames: AtomicU64,
    last_pts_us: AtomicI64,
    worst_delay_us: AtomicI64,
}

impl StatsSink {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            late_frames: AtomicU64::new(0),
            last_pts_us: AtomicI64::new(0),
            worst_delay_us: AtomicI64::new(i64::MAX),
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn late_frames(&self) -> u64 {
        self.late_frames.load(Ordering::Relaxed)
    }

    pub fn last_pts_us(&self) -> i64 {
        self.last_pts_us.load(Ordering::Relaxed)
    }

    /// Most negative delay seen, `None` before the first frame
    pub fn worst_delay_us(&self) -> Option<i64> {
        match self.worst_delay_us.load(Ordering::Relaxed) {
            i64::MAX => None,
            d => Some(d),
        }
    }
}

impl Default for StatsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for StatsSink {
    fn deliver(&self, frame: &VideoFrame<'_>, _: Option<&DisplayTarget>) -> Result<(), SinkError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        self.last_pts_us.store(frame.pts_us, Ordering::Relaxed);
        if frame.timing.is_late() {
            self.late_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.worst_delay_us
            .fetch_min(frame.timing.delay_us, Ordering::Relaxed);
        tracing::debug!(
            "frame #{} pts={}us delay={}us {}x{}",
            frame.sequence,
            frame.pts_us,
            frame.timing.delay_us,
            frame.width(),
            frame.height()
        );
        Ok(())
    }
}

/// Appends raw frame data to a file.
pub struct RawFileSink {
    writer: Mutex<BufWriter<File>>,
    frames: AtomicU64,
}

impl RawFileSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        tracing::info!("Dumping raw frames to {}", path.display());
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            frames: AtomicU64::new(0),
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn finish(&self) -> Result<(), SinkError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl FrameSink for RawFileSink {
    fn deliver(&self, frame: &VideoFrame<'_>, _: Option<&DisplayTarget>) -> Result<(), SinkError> {
        self.writer.lock().write_all(frame.data)?;
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for RawFileSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.get_mut().flush() {
            tracing::warn!("Raw frame dump flush failed: {}", e);
        }
    }
}

/// Hands every frame to each inner sink in order; the first error wins.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn FrameSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn FrameSink>>) -> Self {
        Self { sinks }
    }
}

impl FrameSink for FanoutSink {
    fn deliver(
        &self,
        frame: &VideoFrame<'_>,
        target: Option<&DisplayTarget>,
    ) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(frame, target) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FrameTiming;
    use crate::frame::FrameGeometry;
    use std::io::Read;

    fn frame(data: &[u8], pts_us: i64, delay_us: i64) -> VideoFrame<'_> {
        VideoFrame {
            data,
            geometry: FrameGeometry::new(2, 2, PixelFormat::Nv12),
            pts_us,
            timing: FrameTiming {
                pts_us,
                delay_us,
                anchored: false,
            },
            sequence: 0,
            end_of_stream: false,
        }
    }

    #[test]
    fn test_stats_sink_counts() {
        let sink = StatsSink::new();
        assert_eq!(sink.worst_delay_us(), None);

        let data = [0u8; 6];
        sink.deliver(&frame(&data, 0, 0), None).unwrap();
        sink.deliver(&frame(&data, 33_333, -4_000), None).unwrap();
        sink.deliver(&frame(&data, 66_666, 12_000), None).unwrap();

        assert_eq!(sink.frames(), 3);
        assert_eq!(sink.bytes(), 18);
        assert_eq!(sink.late_frames(), 1);
        assert_eq!(sink.last_pts_us(), 66_666);
        assert_eq!(sink.worst_delay_us(), Some(-4_000));
    }

    #[test]
    fn test_raw_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frames.yuv");
        {
            let sink = RawFileSink::create(&path).unwrap();
            sink.deliver(&frame(&[1, 2, 3], 0, 0), None).unwrap();
            sink.deliver(&frame(&[4, 5], 1, 0), None).unwrap();
            assert_eq!(sink.frames(), 2);
        }

        let mut contents = Vec::new();
        File::open(&path)
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = Arc::new(StatsSink::new());
        let b = Arc::new(StatsSink::new());
        let fanout = FanoutSink::new(vec![a.clone() as Arc<dyn FrameSink>, b.clone() as Arc<dyn FrameSink>]);

        fanout.deliver(&frame(&[0; 6], 0, 0), None).unwrap();
        assert_eq!(a.frames(), 1);
        assert_eq!(b.frames(), 1);
    }

    #[test]
    fn test_headless_surface_geometry() {
        let surface = Arc::new(HeadlessSurface::new(7));
        let target = DisplayTarget::new(surface.clone());
        target
            .surface()
            .set_buffers_geometry(640, 360, PixelFormat::Nv12)
            .unwrap();

        assert_eq!(target.id(), 7);
        assert_eq!(surface.geometry(), Some((640, 360, PixelFormat::Nv12)));
    }
}
