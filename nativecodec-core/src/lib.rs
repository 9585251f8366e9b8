//! # nativecodec Core
//!
//! Real-time playback core: a single-threaded looper drives demuxer →
//! decoder → sink, paced against a presentation clock and controlled from
//! any thread.

// ============================================================================
// Scheduling / Timing
// ============================================================================
pub mod looper;
pub mod clock;

// ============================================================================
// Collaborator Interfaces
// ============================================================================
pub mod frame;
pub mod demuxer;
pub mod codec;
pub mod sink;
pub mod backend;

// ============================================================================
// Reference Collaborators
// ============================================================================
pub mod nal;
pub mod synthetic;
pub mod elementary;
pub mod reference_codec;

// ============================================================================
// Playback
// ============================================================================
pub mod config;
pub mod status;
pub mod session;
pub mod pump;
pub mod engine;

#[cfg(test)]
mod test_support;

pub use backend::{BackendConfig, MediaBackend, ReferenceBackend};
pub use clock::{FrameTiming, PacingPolicy};
pub use config::{ConfigError, EngineConfig};
pub use demuxer::MediaSource;
pub use engine::{EngineError, PlaybackController, PlaybackEngine};
pub use sink::{DisplayTarget, FrameSink};
pub use status::{EngineStats, PlaybackState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
