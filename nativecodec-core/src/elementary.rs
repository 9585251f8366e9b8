//! Raw H.264 elementary stream demuxer (`.h264` / `.264`)
//!
//! The whole file is indexed into access units at open time. Raw streams
//! carry no timestamps, so presentation times are synthesized from a fixed
//! frame rate in decode order; streams with B-frames will show reordered
//! timestamps.

use crate::demuxer::{Demuxer, MediaError, SampleFlags, SeekMode, TrackFormat};
use crate::nal::{self, AccessUnit};
use std::path::Path;

pub const MIME: &str = "video/avc";

pub struct ElementaryStreamDemuxer {
    data: Vec<u8>,
    units: Vec<AccessUnit>,
    format: TrackFormat,
    frame_rate: f64,
    selected: bool,
    cursor: usize,
}

impl ElementaryStreamDemuxer {
    pub fn open(path: &Path, frame_rate: f64) -> Result<Self, MediaError> {
        let data = std::fs::read(path).map_err(|e| MediaError::Open {
            uri: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_bytes(data, frame_rate).map_err(|reason| MediaError::Open {
            uri: path.display().to_string(),
            reason,
        })
    }

    pub fn from_bytes(data: Vec<u8>, frame_rate: f64) -> Result<Self, String> {
        if !nal::is_annexb(&data) {
            return Err("not an Annex B byte stream".to_string());
        }
        if !(frame_rate > 0.0) {
            return Err(format!("invalid frame rate {}", frame_rate));
        }

        let nals = nal::find_nal_units(&data);
        let units = nal::group_access_units(&data, &nals);
        if units.is_empty() {
            return Err("no coded pictures found".to_string());
        }

        let mut format = TrackFormat {
            mime: Some(MIME.to_string()),
            frame_rate: Some(frame_rate),
            duration_us: Some((units.len() as f64 * 1_000_000.0 / frame_rate).round() as i64),
            max_input_size: units.iter().map(|u| u.len).max(),
            ..Default::default()
        };

        // First SPS/PPS pair becomes codec config and supplies the picture size.
        let first = |wanted: u8| nals.iter().find(|n| n.nal_type(&data) == wanted);
        if let Some(sps) = first(nal::NAL_SPS) {
            let bytes = sps.bytes(&data);
            if let Some(info) = nal::parse_sps(bytes) {
                format.width = Some(info.width);
                format.height = Some(info.height);
                tracing::debug!(
                    "SPS: profile {} level {} {}x{}",
                    info.profile_idc,
                    info.level_idc,
                    info.width,
                    info.height
                );
            }
            format.codec_config.extend_from_slice(&nal::ANNEX_B_START_CODE);
            format.codec_config.extend_from_slice(bytes);
        }
        if let Some(pps) = first(nal::NAL_PPS) {
            format.codec_config.extend_from_slice(&nal::ANNEX_B_START_CODE);
            format.codec_config.extend_from_slice(pps.bytes(&data));
        }

        let sync = units.iter().filter(|u| u.sync).count();
        tracing::info!(
            "H.264 stream: {} access units ({} IDR), {}",
            units.len(),
            sync,
            format
        );

        Ok(Self {
            data,
            units,
            format,
            frame_rate,
            selected: false,
            cursor: 0,
        })
    }

    fn pts_of(&self, index: usize) -> i64 {
        (index as f64 * 1_000_000.0 / self.frame_rate).round() as i64
    }

    fn current(&self) -> Option<&AccessUnit> {
        if !self.selected {
            return None;
        }
        self.units.get(self.cursor)
    }
}

impl Demuxer for ElementaryStreamDemuxer {
    fn track_count(&self) -> usize {
        1
    }

    fn track_format(&self, index: usize) -> Option<TrackFormat> {
        (index == 0).then(|| self.format.clone())
    }

    fn select_track(&mut self, index: usize) -> Result<(), MediaError> {
        if index != 0 {
            return Err(MediaError::TrackOutOfRange(index));
        }
        self.selected = true;
        self.cursor = 0;
        Ok(())
    }

    fn read_sample(&mut self, buf: &mut [u8]) -> Result<Option<usize>, MediaError> {
        if !self.selected {
            return Err(MediaError::NoTrackSelected);
        }
        let Some(unit) = self.current() else {
            return Ok(None);
        };
        if buf.len() < unit.len {
            return Err(MediaError::SampleTooLarge {
                size: unit.len,
                capacity: buf.len(),
            });
        }
        let len = unit.len;
        buf[..len].copy_from_slice(&self.data[unit.offset..unit.offset + len]);
        Ok(Some(len))
    }

    fn sample_time_us(&self) -> Option<i64> {
        self.current().map(|_| self.pts_of(self.cursor))
    }

    fn sample_flags(&self) -> SampleFlags {
        match self.current() {
            Some(unit) if unit.sync => SampleFlags::SYNC,
            _ => SampleFlags::empty(),
        }
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.units.len() {
            self.cursor += 1;
        }
        self.current().is_some()
    }

    fn seek_to(&mut self, time_us: i64, mode: SeekMode) -> Result<(), MediaError> {
        if self.units.is_empty() {
            return Ok(());
        }
        let target = ((time_us.max(0) as f64 * self.frame_rate / 1_000_000.0).floor() as usize)
            .min(self.units.len() - 1);

        let previous = self.units[..=target].iter().rposition(|u| u.sync);
        let next = self.units[target..]
            .iter()
            .position(|u| u.sync)
            .map(|i| i + target);

        self.cursor = match (mode, previous, next) {
            (SeekMode::PreviousSync, Some(p), _) => p,
            (SeekMode::NextSync, _, Some(n)) => n,
            (SeekMode::ClosestSync, Some(p), Some(n)) => {
                if target - p <= n - target {
                    p
                } else {
                    n
                }
            }
            (_, Some(p), None) => p,
            (_, None, Some(n)) => n,
            // No IDR at all: start from the first picture.
            (_, None, None) => 0,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::testing;
    use std::io::Write;

    fn count_pps(config: &[u8]) -> usize {
        nal::find_nal_units(config)
            .iter()
            .filter(|n| n.nal_type(config) == nal::NAL_PPS)
            .count()
    }

    fn demuxer(frames: usize, gop: usize) -> ElementaryStreamDemuxer {
        let data = testing::stream(320, 240, frames, gop);
        let mut demuxer = ElementaryStreamDemuxer::from_bytes(data, 25.0).unwrap();
        demuxer.select_track(0).unwrap();
        demuxer
    }

    #[test]
    fn test_format_from_sps() {
        let demuxer = demuxer(10, 5);
        let format = demuxer.track_format(0).unwrap();

        assert_eq!(format.mime.as_deref(), Some(MIME));
        assert_eq!(format.dimensions(), Some((320, 240)));
        assert_eq!(format.duration_us, Some(400_000));
        assert!(nal::is_annexb(&format.codec_config));
        assert_eq!(count_pps(&format.codec_config), 1);
        assert!(demuxer.track_format(1).is_none());
    }

    #[test]
    fn test_reads_access_units_in_order() {
        let mut demuxer = demuxer(4, 2);
        let mut buf = vec![0u8; 4096];
        let mut samples = Vec::new();

        while let Some(len) = demuxer.read_sample(&mut buf).unwrap() {
            assert!(nal::is_annexb(&buf[..len]));
            samples.push((demuxer.sample_time_us().unwrap(), demuxer.sample_flags()));
            demuxer.advance();
        }

        assert_eq!(
            samples,
            vec![
                (0, SampleFlags::SYNC),
                (40_000, SampleFlags::empty()),
                (80_000, SampleFlags::SYNC),
                (120_000, SampleFlags::empty()),
            ]
        );
    }

    #[test]
    fn test_seek_to_keyframes() {
        let mut demuxer = demuxer(12, 4);

        demuxer.seek_to(250_000, SeekMode::PreviousSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(160_000));

        demuxer.seek_to(250_000, SeekMode::NextSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(320_000));

        demuxer.seek_to(0, SeekMode::ClosestSync).unwrap();
        assert_eq!(demuxer.sample_time_us(), Some(0));
    }

    #[test]
    fn test_rejects_non_annexb() {
        assert!(ElementaryStreamDemuxer::from_bytes(vec![0, 0, 0, 5, 0x67], 30.0).is_err());
    }

    #[test]
    fn test_open_from_file() {
        let mut file = tempfile::Builder::new().suffix(".h264").tempfile().unwrap();
        file.write_all(&testing::stream(160, 96, 3, 3)).unwrap();

        let demuxer = ElementaryStreamDemuxer::open(file.path(), 30.0).unwrap();
        assert_eq!(demuxer.track_count(), 1);
        assert_eq!(demuxer.track_format(0).unwrap().dimensions(), Some((160, 96)));

        let missing = ElementaryStreamDemuxer::open(Path::new("/nonexistent/clip.h264"), 30.0);
        assert!(matches!(missing, Err(MediaError::Open { .. })));
    }
}
