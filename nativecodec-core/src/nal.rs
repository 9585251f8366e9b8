//! H.264 Annex B utilities
//!
//! Start-code scanning, access unit grouping, and just enough SPS parsing to
//! learn the coded picture size.

/// Annex B start code (4-byte version)
pub const ANNEX_B_START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Check if data starts with an Annex B start code
pub fn is_annexb(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    // Check for 4-byte or 3-byte start code
    (data[0] == 0 && data[1] == 0 && data[2] == 0 && data[3] == 1)
        || (data[0] == 0 && data[1] == 0 && data[2] == 1)
}

/// One NAL unit inside an Annex B byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Position of the start code
    pub start: usize,
    /// Position of the NAL header byte
    pub header: usize,
    /// One past the last byte (the next start code or end of data)
    pub end: usize,
}

impl NalUnit {
    pub fn nal_type(&self, data: &[u8]) -> u8 {
        data[self.header] & 0x1F
    }

    /// Header byte plus payload, without the start code
    pub fn bytes<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.header..self.end]
    }
}

pub fn is_vcl(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}

/// Locate every NAL unit in an Annex B stream.
pub fn find_nal_units(data: &[u8]) -> Vec<NalUnit> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }

    let mut units = Vec::with_capacity(starts.len());
    for (k, &(start, header)) in starts.iter().enumerate() {
        let end = starts.get(k + 1).map(|&(s, _)| s).unwrap_or(data.len());
        if header < end {
            units.push(NalUnit { start, header, end });
        }
    }
    units
}

// ============================================================================
// Access Units
// ============================================================================

/// A coded picture with its leading parameter sets and SEI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessUnit {
    pub offset: usize,
    pub len: usize,
    /// Contains an IDR slice
    pub sync: bool,
}

/// Group NAL units into access units (ITU-T H.264 7.4.1.2.3, simplified).
///
/// A new unit begins at an AUD, at parameter sets or SEI following a slice,
/// or at a slice whose `first_mb_in_slice` is zero. Units without any slice
/// are dropped.
pub fn group_access_units(data: &[u8], nals: &[NalUnit]) -> Vec<AccessUnit> {
    let mut units = Vec::new();
    let mut current: Option<(usize, bool)> = None;
    let mut has_vcl = false;

    for nal in nals {
        let nal_type = nal.nal_type(data);
        let boundary = match nal_type {
            NAL_AUD => current.is_some(),
            NAL_SEI | NAL_SPS | NAL_PPS | 14..=18 => has_vcl,
            NAL_SLICE | NAL_IDR => has_vcl && starts_new_picture(nal.bytes(data)),
            _ => false,
        };

        if boundary {
            if let Some((offset, sync)) = current.take() {
                if has_vcl {
                    units.push(AccessUnit {
                        offset,
                        len: nal.start - offset,
                        sync,
                    });
                }
            }
            has_vcl = false;
        }

        let entry = current.get_or_insert((nal.start, false));
        if nal_type == NAL_IDR {
            entry.1 = true;
        }
        if is_vcl(nal_type) {
            has_vcl = true;
        }
    }

    if let (Some((offset, sync)), true) = (current, has_vcl) {
        units.push(AccessUnit {
            offset,
            len: data.len() - offset,
            sync,
        });
    }

    units
}

/// `first_mb_in_slice == 0` is ue(v) coded as a single `1` bit.
fn starts_new_picture(nal: &[u8]) -> bool {
    nal.get(1).map(|b| b & 0x80 != 0).unwrap_or(false)
}

// ============================================================================
// SPS
// ============================================================================

/// Fields of a sequence parameter set the demuxer cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
}

/// Strip emulation prevention bytes (00 00 03 -> 00 00)
pub fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeros = 0;
    for &b in data {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// Parse an SPS NAL (header byte included).
pub fn parse_sps(nal: &[u8]) -> Option<SpsInfo> {
    if nal.first().map(|b| b & 0x1F) != Some(NAL_SPS) {
        return None;
    }
    let rbsp = unescape_rbsp(&nal[1..]);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)? as u8;
    r.read_bits(8)?; // constraint flags
    let level_idc = r.read_bits(8)? as u8;
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bits(1)?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bits(1)? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bits(1)? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    match r.read_ue()? {
        0 => {
            r.read_ue()?;
        }
        1 => {
            r.read_bits(1)?;
            r.read_se()?;
            r.read_se()?;
            let cycle = r.read_ue()?;
            for _ in 0..cycle {
                r.read_se()?;
            }
        }
        _ => {}
    }
    r.read_ue()?; // max_num_ref_frames
    r.read_bits(1)?; // gaps_in_frame_num_value_allowed_flag

    let width_mbs = r.read_ue()? + 1;
    let height_map_units = r.read_ue()? + 1;
    let frame_mbs_only = r.read_bits(1)?;
    if frame_mbs_only == 0 {
        r.read_bits(1)?; // mb_adaptive_frame_field_flag
    }
    r.read_bits(1)?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if r.read_bits(1)? == 1 {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let (sub_width, sub_height) = match chroma_format_idc {
        0 => (1, 1),
        1 => (2, 2),
        2 => (2, 1),
        _ => (1, 1),
    };
    let crop_unit_x = sub_width;
    let crop_unit_y = sub_height * (2 - frame_mbs_only);

    let width = (width_mbs * 16).checked_sub((crop_left + crop_right) * crop_unit_x)?;
    let height = ((2 - frame_mbs_only) * height_map_units * 16)
        .checked_sub((crop_top + crop_bottom) * crop_unit_y)?;

    Some(SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
    })
}

fn skip_scaling_list(r: &mut BitReader<'_>, size: usize) -> Option<()> {
    let mut last = 8i32;
    let mut next = 8i32;
    for _ in 0..size {
        if next != 0 {
            let delta = r.read_se()?;
            next = (last + delta + 256) % 256;
        }
        if next != 0 {
            last = next;
        }
    }
    Some(())
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bits(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            let byte = *self.data.get(self.pos / 8)?;
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Some(value)
    }

    fn read_ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.read_bits(1)? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let rest = self.read_bits(zeros)?;
        Some(((1u64 << zeros) - 1 + rest as u64) as u32)
    }

    fn read_se(&mut self) -> Option<i32> {
        let k = self.read_ue()? as i64;
        let value = if k % 2 == 1 { (k + 1) / 2 } else { -(k / 2) };
        Some(value as i32)
    }
}

// ============================================================================
// Stream builder for tests
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    struct BitWriter {
        bytes: Vec<u8>,
        bits: u32,
    }

    impl BitWriter {
        fn new() -> Self {
            Self {
                bytes: Vec::new(),
                bits: 0,
            }
        }

        fn bit(&mut self, bit: u32) {
            if self.bits % 8 == 0 {
                self.bytes.push(0);
            }
            if bit != 0 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bits % 8);
            }
            self.bits += 1;
        }

        fn bits(&mut self, value: u32, count: u32) {
            for i in (0..count).rev() {
                self.bit((value >> i) & 1);
            }
        }

        fn ue(&mut self, value: u32) {
            let v = value + 1;
            let len = 32 - v.leading_zeros();
            self.bits(0, len - 1);
            self.bits(v, len);
        }

        fn finish(mut self) -> Vec<u8> {
            self.bit(1); // rbsp_stop_one_bit
            self.bytes
        }
    }

    fn escape(rbsp: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(rbsp.len() + 4);
        let mut zeros = 0;
        for &b in rbsp {
            if zeros >= 2 && b <= 3 {
                out.push(0x03);
                zeros = 0;
            }
            zeros = if b == 0 { zeros + 1 } else { 0 };
            out.push(b);
        }
        out
    }

    /// Baseline SPS NAL (header included) for the given picture size.
    pub fn sps(width: u32, height: u32) -> Vec<u8> {
        let width_mbs = width.div_ceil(16);
        let height_mbs = height.div_ceil(16);
        let mut w = BitWriter::new();
        w.bits(66, 8); // baseline
        w.bits(0, 8);
        w.bits(30, 8);
        w.ue(0); // sps id
        w.ue(0); // log2_max_frame_num_minus4
        w.ue(2); // pic_order_cnt_type
        w.ue(1); // max_num_ref_frames
        w.bit(0);
        w.ue(width_mbs - 1);
        w.ue(height_mbs - 1);
        w.bit(1); // frame_mbs_only
        w.bit(1); // direct_8x8
        let crop_right = (width_mbs * 16 - width) / 2;
        let crop_bottom = (height_mbs * 16 - height) / 2;
        if crop_right > 0 || crop_bottom > 0 {
            w.bit(1);
            w.ue(0);
            w.ue(crop_right);
            w.ue(0);
            w.ue(crop_bottom);
        } else {
            w.bit(0);
        }
        w.bit(0); // vui

        let mut nal = vec![0x67];
        nal.extend(escape(&w.finish()));
        nal
    }

    /// Annex B stream with `frames` pictures and an IDR every `gop` frames.
    pub fn stream(width: u32, height: u32, frames: usize, gop: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..frames {
            if i % gop == 0 {
                out.extend_from_slice(&ANNEX_B_START_CODE);
                out.extend(sps(width, height));
                out.extend_from_slice(&ANNEX_B_START_CODE);
                out.extend_from_slice(&[0x68, 0xCE, 0x38, 0x80]);
                out.extend_from_slice(&ANNEX_B_START_CODE);
                out.extend_from_slice(&[0x65, 0x88, 0x84, i as u8, 0x21]);
            } else {
                out.extend_from_slice(&[0x00, 0x00, 0x01]);
                out.extend_from_slice(&[0x41, 0x9A, i as u8, 0x5C]);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_annexb() {
        assert!(is_annexb(&[0x00, 0x00, 0x00, 0x01, 0x67]));
        assert!(is_annexb(&[0x00, 0x00, 0x01, 0x67]));
        assert!(!is_annexb(&[0x00, 0x00, 0x00, 0x05, 0x67])); // AVCC
    }

    #[test]
    fn test_find_nal_units_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB, 0xCC];
        let nals = find_nal_units(&data);

        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], NalUnit { start: 0, header: 4, end: 6 });
        assert_eq!(nals[1].nal_type(&data), NAL_PPS);
        assert_eq!(nals[1].bytes(&data), &[0x68, 0xBB, 0xCC]);
    }

    #[test]
    fn test_unescape_rbsp() {
        assert_eq!(unescape_rbsp(&[0, 0, 3, 1, 0, 0, 3]), vec![0, 0, 1, 0, 0]);
        assert_eq!(unescape_rbsp(&[1, 3, 0, 3]), vec![1, 3, 0, 3]);
    }

    #[test]
    fn test_parse_sps_with_cropping() {
        let info = parse_sps(&testing::sps(1920, 1080)).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
        assert_eq!(info.profile_idc, 66);

        let info = parse_sps(&testing::sps(640, 368)).unwrap();
        assert_eq!((info.width, info.height), (640, 368));
    }

    #[test]
    fn test_parse_sps_rejects_other_nals() {
        assert_eq!(parse_sps(&[0x68, 0xCE]), None);
        assert_eq!(parse_sps(&[]), None);
    }

    #[test]
    fn test_group_access_units() {
        let data = testing::stream(320, 240, 7, 3);
        let nals = find_nal_units(&data);
        let units = group_access_units(&data, &nals);

        assert_eq!(units.len(), 7);
        let sync: Vec<bool> = units.iter().map(|u| u.sync).collect();
        assert_eq!(sync, vec![true, false, false, true, false, false, true]);

        // Units tile the stream.
        assert_eq!(units[0].offset, 0);
        for pair in units.windows(2) {
            assert_eq!(pair[0].offset + pair[0].len, pair[1].offset);
        }
        let last = units[6];
        assert_eq!(last.offset + last.len, data.len());
    }
}
