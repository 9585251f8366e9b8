//! Demuxer interface
//!
//! Container parsing is a collaborator: the engine only needs track
//! metadata, one compressed sample at a time, and keyframe seeking.

use crate::frame::PixelFormat;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("Failed to open {uri}: {reason}")]
    Open { uri: String, reason: String },
    #[error("Unsupported source: {0}")]
    Unsupported(String),
    #[error("Track {0} out of range")]
    TrackOutOfRange(usize),
    #[error("No track selected")]
    NoTrackSelected,
    #[error("Sample of {size} bytes does not fit buffer of {capacity}")]
    SampleTooLarge { size: usize, capacity: usize },
    #[error("Demuxer already closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Sources
// ============================================================================

/// Where compressed media comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    /// A file on disk; the container is picked by extension
    Path(PathBuf),
    /// A URI handled by the backend (e.g. `synthetic:?fps=30`)
    Uri(Url),
}

impl MediaSource {
    /// Interpret a command-line style locator.
    ///
    /// Anything that parses as a URL with a scheme longer than one
    /// character is a URI; everything else (including `C:\...`) is a path.
    pub fn parse(locator: &str) -> Self {
        match Url::parse(locator) {
            Ok(url) if url.scheme().len() > 1 && url.scheme() != "file" => Self::Uri(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Self::Path(path),
                Err(()) => Self::Path(PathBuf::from(locator)),
            },
            _ => Self::Path(PathBuf::from(locator)),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }

    /// Lowercase file extension, if this is a path
    pub fn extension(&self) -> Option<String> {
        match self {
            Self::Path(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase()),
            Self::Uri(_) => None,
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Uri(url) => write!(f, "{}", url),
        }
    }
}

// ============================================================================
// Track Metadata
// ============================================================================

/// Key/value description of a track or of decoder output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackFormat {
    pub mime: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_us: Option<i64>,
    pub frame_rate: Option<f64>,
    pub max_input_size: Option<usize>,
    pub color_format: Option<PixelFormat>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Codec configuration data (SPS/PPS for AVC)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codec_config: Vec<u8>,
}

impl TrackFormat {
    pub fn video(mime: &str, width: u32, height: u32) -> Self {
        Self {
            mime: Some(mime.to_string()),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channels: u16) -> Self {
        Self {
            mime: Some(mime.to_string()),
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            ..Default::default()
        }
    }

    pub fn is_video(&self) -> bool {
        self.mime
            .as_deref()
            .map(|m| m.starts_with("video/"))
            .unwrap_or(false)
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

impl fmt::Display for TrackFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mime={}", self.mime.as_deref().unwrap_or("<none>"))?;
        if let Some((w, h)) = self.dimensions() {
            write!(f, ", size={}x{}", w, h)?;
        }
        if let Some(fps) = self.frame_rate {
            write!(f, ", frame-rate={:.3}", fps)?;
        }
        if let Some(d) = self.duration_us {
            write!(f, ", duration-us={}", d)?;
        }
        if let Some(rate) = self.sample_rate {
            write!(f, ", sample-rate={}", rate)?;
        }
        if let Some(ch) = self.channels {
            write!(f, ", channels={}", ch)?;
        }
        if let Some(color) = self.color_format {
            write!(f, ", color-format={:?}", color)?;
        }
        Ok(())
    }
}

bitflags! {
    /// Per-sample properties reported by the demuxer
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SampleFlags: u32 {
        const SYNC = 1;
        const ENCRYPTED = 2;
    }
}

/// How a seek target snaps to keyframes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekMode {
    PreviousSync,
    NextSync,
    ClosestSync,
}

// ============================================================================
// Demuxer Trait
// ============================================================================

/// Sequential sample reader over one selected track.
///
/// Positioned on the first sample after `select_track`; `read_sample` reads
/// the current sample without moving, `advance` moves to the next one.
pub trait Demuxer: Send {
    fn track_count(&self) -> usize;

    fn track_format(&self, index: usize) -> Option<TrackFormat>;

    fn select_track(&mut self, index: usize) -> Result<(), MediaError>;

    /// Copy the current sample into `buf`. `Ok(None)` at end of stream.
    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError>;

    /// Presentation time of the current sample, `None` at end of stream.
    fn sample_time_us(&self) -> Option<i64>;

    fn sample_flags(&self) -> SampleFlags;

    /// Move to the next sample. Returns false once past the last one.
    fn advance(&mut self) -> bool;

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<(), MediaError>;

    /// Release underlying resources. Called once by the owner.
    fn close(&mut self) {}
}

/// Owns a demuxer and closes it exactly once.
pub struct DemuxerHandle {
    inner: Option<Box<dyn Demuxer>>,
}

impl DemuxerHandle {
    pub fn new(demuxer: Box<dyn Demuxer>) -> Self {
        Self {
            inner: Some(demuxer),
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut (dyn Demuxer + 'static)> {
        self.inner.as_deref_mut()
    }

    pub fn get(&self) -> Option<&(dyn Demuxer + 'static)> {
        self.inner.as_deref()
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    /// Close and drop the demuxer. Returns false if it was already gone.
    pub fn release(&mut self) -> bool {
        match self.inner.take() {
            Some(mut demuxer) => {
                demuxer.close();
                true
            }
            None => false,
        }
    }
}

impl Drop for DemuxerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources() {
        assert!(matches!(
            MediaSource::parse("synthetic:?fps=24"),
            MediaSource::Uri(ref u) if u.scheme() == "synthetic"
        ));
        assert_eq!(
            MediaSource::parse("clips/intro.h264"),
            MediaSource::Path(PathBuf::from("clips/intro.h264"))
        );
        // Drive letters are not schemes.
        assert!(matches!(MediaSource::parse("C:\\movie.h264"), MediaSource::Path(_)));
    }

    #[test]
    fn test_extension_is_lowercased() {
        let source = MediaSource::from_path("/tmp/CLIP.H264");
        assert_eq!(source.extension().as_deref(), Some("h264"));
    }

    #[test]
    fn test_track_format_display() {
        let mut format = TrackFormat::video("video/avc", 640, 360);
        format.frame_rate = Some(30.0);
        assert_eq!(
            format.to_string(),
            "mime=video/avc, size=640x360, frame-rate=30.000"
        );
        assert!(format.is_video());
        assert!(!TrackFormat::audio("audio/raw", 48_000, 2).is_video());
    }
}
