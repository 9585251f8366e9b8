//! Media backends
//!
//! A backend turns a source locator into a demuxer and a track format into
//! a decoder. Platform codec stacks plug in here; the reference backend
//! covers synthetic sources and raw H.264 files in software.

use crate::codec::{CodecError, Decoder};
use crate::demuxer::{Demuxer, MediaError, MediaSource, TrackFormat};
use crate::elementary::ElementaryStreamDemuxer;
use crate::reference_codec::{ReferenceCodec, ReferenceCodecConfig};
use crate::synthetic::{self, SyntheticDemuxer};
use serde::{Deserialize, Serialize};

pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;

    fn open_demuxer(&self, source: &MediaSource) -> Result<Box<dyn Demuxer>, MediaError>;

    /// Create an unstarted decoder for `format`.
    fn create_decoder(&self, format: &TrackFormat) -> Result<Box<dyn Decoder>, CodecError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Frame rate assumed for raw elementary streams
    pub elementary_frame_rate: f64,
    pub codec: ReferenceCodecConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            elementary_frame_rate: 30.0,
            codec: ReferenceCodecConfig::default(),
        }
    }
}

pub struct ReferenceBackend {
    config: BackendConfig,
}

impl ReferenceBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

impl MediaBackend for ReferenceBackend {
    fn name(&self) -> &str {
        "reference"
    }

    fn open_demuxer(&self, source: &MediaSource) -> Result<Box<dyn Demuxer>, MediaError> {
        match source {
            MediaSource::Uri(url) if url.scheme() == synthetic::SCHEME => {
                Ok(Box::new(SyntheticDemuxer::open(url)?))
            }
            MediaSource::Uri(url) => Err(MediaError::Unsupported(format!(
                "scheme '{}'",
                url.scheme()
            ))),
            MediaSource::Path(path) => {
                let ext = source.extension().unwrap_or_default();
                match ext.as_str() {
                    "h264" | "264" | "avc" | "h26l" => Ok(Box::new(ElementaryStreamDemuxer::open(
                        path,
                        self.config.elementary_frame_rate,
                    )?)),
                    other => Err(MediaError::Unsupported(format!("container '{}'", other))),
                }
            }
        }
    }

    fn create_decoder(&self, format: &TrackFormat) -> Result<Box<dyn Decoder>, CodecError> {
        Ok(Box::new(ReferenceCodec::configure(format, &self.config.codec)?))
    }
}
