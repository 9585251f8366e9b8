//! Synthetic media source
//!
//! Generates a constant-frame-rate video track (and optionally a silent
//! audio track) from a `synthetic:` URI, e.g.
//! `synthetic:?duration_ms=10000&fps=30&width=640&height=360&gop=30&audio=1`.
//! Used for headless runs and tests where no media file is at hand.

use crate::demuxer::{Demuxer, MediaError, SampleFlags, SeekMode, TrackFormat};
use serde::{Deserialize, Serialize};
use url::Url;

pub const SCHEME: &str = "synthetic";
pub const MIME: &str = "video/x-synthetic";

/// Bytes at the front of every synthetic sample: index (u32 LE) + sync flag
const SAMPLE_HEADER: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticParams {
    pub duration_ms: u64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Keyframe interval in frames
    pub gop: u32,
    pub audio: bool,
    /// Compressed sample size in bytes
    pub sample_size: usize,
}

impl Default for SyntheticParams {
    fn default() -> Self {
        Self {
            duration_ms: 10_000,
            fps: 30.0,
            width: 640,
            height: 360,
            gop: 30,
            audio: false,
            sample_size: 2048,
        }
    }
}

impl SyntheticParams {
    pub fn from_url(url: &Url) -> Result<Self, MediaError> {
        if url.scheme() != SCHEME {
            return Err(MediaError::Unsupported(url.to_string()));
        }

        let bad = |key: &str, value: &str| MediaError::Open {
            uri: url.to_string(),
            reason: format!("invalid {}={}", key, value),
        };

        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match &*key {
                "duration_ms" => params.duration_ms = value.parse().map_err(|_| bad(&*key, &*value))?,
                "fps" => params.fps = value.parse().map_err(|_| bad(&*key, &*value))?,
                "width" => params.width = value.parse().map_err(|_| bad(&*key, &*value))?,
                "height" => params.height = value.parse().map_err(|_| bad(&*key, &*value))?,
                "gop" => params.gop = value.parse().map_err(|_| bad(&*key, &*value))?,
                "sample_size" => params.sample_size = value.parse().map_err(|_| bad(&*key, &*value))?,
                "audio" => params.audio = matches!(&*value, "1" | "true" | "yes"),
                other => tracing::warn!("Ignoring unknown synthetic parameter '{}'", other),
            }
        }

        if !(params.fps > 0.0) || params.width == 0 || params.height == 0 || params.gop == 0 {
            return Err(MediaError::Open {
                uri: url.to_string(),
                reason: "fps, width, height and gop must be positive".to_string(),
            });
        }
        params.sample_size = params.sample_size.max(SAMPLE_HEADER);
        Ok(params)
    }

    pub fn to_url(&self) -> String {
        format!(
            "{}:?duration_ms={}&fps={}&width={}&height={}&gop={}&audio={}&sample_size={}",
            SCHEME,
            self.duration_ms,
            self.fps,
            self.width,
            self.height,
            self.gop,
            u8::from(self.audio),
            self.sample_size
        )
    }

    pub fn frame_count(&self) -> u64 {
        (self.duration_ms as f64 * self.fps / 1000.0).round() as u64
    }

    pub fn frame_duration_us(&self) -> f64 {
        1_000_000.0 / self.fps
    }

    fn pts_of(&self, index: u64) -> i64 {
        (index as f64 * self.frame_duration_us()).round() as i64
    }

    fn video_format(&self) -> TrackFormat {
        let mut format = TrackFormat::video(MIME, self.width, self.height);
        format.frame_rate = Some(self.fps);
        format.duration_us = Some(self.duration_ms as i64 * 1_000);
        format.max_input_size = Some(self.sample_size);
        format
    }
}

pub struct SyntheticDemuxer {
    params: SyntheticParams,
    tracks: Vec<TrackFormat>,
    selected: Option<usize>,
    cursor: u64,
    frames: u64,
}

impl SyntheticDemuxer {
    pub fn new(params: SyntheticParams) -> Self {
        let mut tracks = vec![params.video_format()];
        if params.audio {
            let mut audio = TrackFormat::audio("audio/raw", 48_000, 2);
            audio.duration_us = Some(params.duration_ms as i64 * 1_000);
            tracks.push(audio);
        }
        let frames = params.frame_count();

        tracing::debug!(
            "Synthetic source: {} frames at {:.3} fps ({}x{}, gop {})",
            frames,
            params.fps,
            params.width,
            params.height,
            params.gop
        );

        Self {
            params,
            tracks,
            selected: None,
            cursor: 0,
            frames,
        }
    }

    pub fn open(url: &Url) -> Result<Self, MediaError> {
        Ok(Self::new(SyntheticParams::from_url(url)?))
    }

    fn video_selected(&self) -> bool {
        self.selected == Some(0)
    }

    fn at_end(&self) -> bool {
        !self.video_selected() || self.cursor >= self.frames
    }
}

impl Demuxer for SyntheticDemuxer {
    fn track_count(&self) -> usize {
        self.tracks.len()
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        self.tracks.get(index).cloned()
    }

    fn select_track(&mut self, index: usize) -> Result<(), MediaError> {
        if index >= self.tracks.len() {
            return Err(MediaError::TrackOutOfRange(index));
        }
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        if self.selected.is_none() {
            return Err(MediaError::NoTrackSelected);
        }
        // The audio track carries no payload.
        if self.at_end() {
            return Ok(None);
        }

        let size = self.params.sample_size;
        if buf.len() < size {
            return Err(MediaError::SampleTooLarge {
                size,
                capacity: buf.len(),
            });
        }

        buf[..4].copy_from_slice(&(self.cursor as u32).to_le_bytes());
        buf[4] = u8::from(self.sample_flags().contains(SampleFlags::SYNC));
        let fill = (self.cursor % 251) as u8;
        buf[SAMPLE_HEADER..size].fill(fill);
        Ok(Some(size))
    }

    fn sample_time_us(&self) -> Option<i64> {
        if self.at_end() {
            return None;
        }
        Some(self.params.pts_of(self.cursor))
    }

    fn sample_flags(&self) -> SampleFlags {
        if !self.at_end() && self.cursor % self.params.gop as u64 == 0 {
            SampleFlags::SYNC
        } else {
            SampleFlags::empty()
        }
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.frames {
            self.cursor += 1;
        }
        !self.at_end()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<(), MediaError> {
        if !self.video_selected() {
            return Ok(());
        }
        let gop = self.params.gop as u64;
        let target = (time_us.max(0) as f64 / self.params.frame_duration_us()).floor() as u64;
        let target = target.min(self.frames.saturating_sub(1));

        let previous = target - target % gop;
        let next = previous + if target % gop == 0 { 0 } else { gop };
        self.cursor = match mode {
            SeekMode::PreviousSync => previous,
            SeekMode::NextSync => next.min(self.frames),
            SeekMode::ClosestSync => {
                if target - previous <= next - target || next >= self.frames {
                    previous
                } else {
                    next
                }
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demuxer(query: &str) -> SyntheticDemuxer {
        let url = Url::parse(&format!("synthetic:?{}", query)).unwrap();
        let mut demuxer = SyntheticDemuxer::open(&url).unwrap();
        demuxer.select_track(0).unwrap();
        demuxer
    }

    #[test]
    fn test_params_from_url() {
        let url = Url::parse("synthetic:?duration_ms=2000&fps=25&width=320&height=180&audio=1")
            .unwrap();
        let params = SyntheticParams::from_url(&url).unwrap();

        assert_eq!(params.frame_count(), 50);
        assert_eq!((params.width, params.height), (320, 180));
        assert!(params.audio);
        assert_eq!(params.gop, 30);

        let back = Url::parse(&params.to_url()).unwrap();
        assert_eq!(SyntheticParams::from_url(&back).unwrap(), params);
    }

    #[test]
    fn test_invalid_parameters() {
        let url = Url::parse("synthetic:?fps=0").unwrap();
        assert!(SyntheticParams::from_url(&url).is_err());
        let url = Url::parse("synthetic:?width=wide").unwrap();
        assert!(SyntheticParams::from_url(&url).is_err());
    }

    #[test]
    fn test_tracks() {
        let url = Url::parse("synthetic:?audio=1").unwrap();
        let demuxer = SyntheticDemuxer::open(&url).unwrap();
        assert_eq!(demuxer.track_count(), 2);
        assert!(demuxer.track_format(0).unwrap().is_video());
        assert!(!demuxer.track_format(1).unwrap().is_video());
        assert!(demuxer.track_format(2).is_none());
    }

    #[test]
    fn test_sequential_read() {
        let mut demuxer = demuxer("duration_ms=100&fps=30&gop=2&sample_size=16");
        let mut buf = [0u8; 64];
        let mut times = Vec::new();
        let mut syncs = Vec::new();

        while let Some(size) = demuxer.read_sample(&mut buf).unwrap() {
            assert_eq!(size, 16);
            times.push(demuxer.sample_time_us().unwrap());
            syncs.push(buf[4] == 1);
            demuxer.advance();
        }

        assert_eq!(times, vec![0, 33_333, 66_667]);
        assert_eq!(syncs, vec![true, false, true]);
        assert_eq!(demuxer.sample_time_us(), None);
    }

    #[test]
    fn test_small_buffer_is_an_error() {
        let mut demuxer = demuxer("sample_size=32");
        let mut buf = [0u8; 8];
        assert!(matches!(
            demuxer.read_sample(&mut buf),
            Err(MediaError::SampleTooLarge { size: 32, capacity: 8 })
        ));
    }

    #[test]
    fn test_seek_snaps_to_keyframes() {
        let mut demuxer = demuxer("duration_ms=10000&fps=10&gop=10");

        demuxer.seek_to(2_500_000, SeekMode::PreviousSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(2_000_000));

        demuxer.seek_to(2_500_000, SeekMode::NextSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(3_000_000));

        demuxer.seek_to(2_800_000, SeekMode::ClosestSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(3_000_000));

        demuxer.seek_to(0, SeekMode::NextSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(0));
        assert_eq!(demuxer.sample_flags(), SampleFlags::SYNC);
    }

    #[test]
    fn test_seek_past_end_clamps() {
        let mut demuxer = demuxer("duration_ms=1000&fps=10&gop=4");
        demuxer.seek_to(60_000_000, SeekMode::PreviousSync).unwrap();
        // Last frame is 9, previous keyframe is 8.
        assert_eq!(demuxer.sample_time_us(), Some(800_000));
    }
}
