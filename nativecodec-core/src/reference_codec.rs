// ============================================================================
// Reference Codec - software stand-in for a platform decoder
// ============================================================================
//
// Follows the buffer-index protocol of hardware codecs closely enough to
// drive the engine end to end:
// • fixed pools of input and output slots
// • output lags input by `latency_frames` until end of stream
// • FormatChanged is reported once, before the first output buffer
// • flush drops everything in flight; end of stream yields an empty EOS buffer
//
// Compressed payloads are not interpreted. Each output is an NV12 test
// pattern that moves with the frame counter so motion is visible.

use crate::codec::{BufferFlags, BufferInfo, CodecError, Decoder, OutputStatus};
use crate::demuxer::TrackFormat;
use crate::frame::{FrameGeometry, PixelFormat};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceCodecConfig {
    pub input_slots: usize,
    pub output_slots: usize,
    /// Inputs held back before the first output appears
    pub latency_frames: usize,
    /// Minimum input slot size; grown to the track's max input size
    pub input_capacity: usize,
    /// Used when the track does not declare its size
    pub fallback_width: u32,
    pub fallback_height: u32,
}

impl Default for ReferenceCodecConfig {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            latency_frames: 2,
            input_capacity: 1 << 20,
            fallback_width: 640,
            fallback_height: 360,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Ready,
    Dequeued,
}

struct OutputSlot {
    data: Vec<u8>,
    info: BufferInfo,
    state: SlotState,
}

struct PendingInput {
    pts_us: i64,
    size: usize,
    flags: BufferFlags,
}

pub struct ReferenceCodec {
    name: String,
    mime: String,
    config: ReferenceCodecConfig,
    geometry: FrameGeometry,
    input_capacity: usize,
    running: bool,
    inputs: Vec<Vec<u8>>,
    input_owned: Vec<bool>,
    free_inputs: VecDeque<usize>,
    pending: VecDeque<PendingInput>,
    outputs: Vec<OutputSlot>,
    ready: VecDeque<usize>,
    format_announced: bool,
    input_eos: bool,
    frame_counter: u64,
}

impl ReferenceCodec {
    pub fn configure(format: &TrackFormat, config: &ReferenceCodecConfig) -> Result<Self, CodecError> {
        let mime = format
            .mime
            .clone()
            .ok_or_else(|| CodecError::Configure("track has no mime type".to_string()))?;
        if !format.is_video() {
            return Err(CodecError::UnsupportedMime(mime));
        }
        if config.input_slots == 0 || config.output_slots == 0 {
            return Err(CodecError::Configure("slot pools must not be empty".to_string()));
        }

        let (width, height) = format
            .dimensions()
            .unwrap_or((config.fallback_width, config.fallback_height));
        if width == 0 || height == 0 {
            return Err(CodecError::Configure(format!("invalid size {}x{}", width, height)));
        }

        let input_capacity = config
            .input_capacity
            .max(format.max_input_size.unwrap_or(0));
        let name = format!(
            "reference.{}",
            mime.rsplit('/').next().unwrap_or("video")
        );

        tracing::debug!(
            "{}: {}x{}, {} input slots of {} bytes, latency {}",
            name,
            width,
            height,
            config.input_slots,
            input_capacity,
            config.latency_frames
        );

        Ok(Self {
            name,
            mime,
            config: config.clone(),
            geometry: FrameGeometry::new(width, height, PixelFormat::Nv12),
            input_capacity,
            running: false,
            inputs: Vec::new(),
            input_owned: Vec::new(),
            free_inputs: VecDeque::new(),
            pending: VecDeque::new(),
            outputs: Vec::new(),
            ready: VecDeque::new(),
            format_announced: false,
            input_eos: false,
            frame_counter: 0,
        })
    }

    fn ensure_running(&self) -> Result<(), CodecError> {
        if self.running {
            Ok(())
        } else {
            Err(CodecError::NotStarted)
        }
    }

    fn reset_slots(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.free_inputs = (0..self.inputs.len()).collect();
        self.input_owned.iter_mut().for_each(|owned| *owned = false);
        for slot in &mut self.outputs {
            slot.state = SlotState::Free;
        }
        self.input_eos = false;
    }

    /// Move pending inputs to free output slots once latency allows.
    fn decode_pending(&mut self) {
        while let Some(front) = self.pending.front() {
            if !self.input_eos && self.pending.len() <= self.config.latency_frames {
                break;
            }
            let eos = front.flags.contains(BufferFlags::END_OF_STREAM);
            let skip = front.flags.contains(BufferFlags::CODEC_CONFIG) || (front.size == 0 && !eos);
            if skip {
                self.pending.pop_front();
                continue;
            }

            let Some(slot) = self.outputs.iter().position(|s| s.state == SlotState::Free) else {
                break;
            };
            let Some(input) = self.pending.pop_front() else {
                break;
            };

            let size = if input.size == 0 {
                0
            } else {
                self.frame_counter += 1;
                render_pattern(&mut self.outputs[slot].data, &self.geometry, self.frame_counter);
                self.geometry.frame_size()
            };

            let out = &mut self.outputs[slot];
            out.info = BufferInfo {
                offset: 0,
                size,
                pts_us: input.pts_us,
                flags: input.flags & (BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM),
            };
            out.state = SlotState::Ready;
            self.ready.push_back(slot);
        }
    }

    fn dequeued_output(&self, index: usize) -> Result<&OutputSlot, CodecError> {
        match self.outputs.get(index) {
            Some(slot) if slot.state == SlotState::Dequeued => Ok(slot),
            _ => Err(CodecError::InvalidIndex(index)),
        }
    }
}

fn render_pattern(buf: &mut [u8], geometry: &FrameGeometry, counter: u64) {
    let stride = geometry.stride as usize;
    let luma = stride * geometry.height as usize;
    let shift = (counter * 4) as usize;

    let (y_plane, uv_plane) = buf.split_at_mut(luma);
    for (row, line) in y_plane.chunks_exact_mut(stride).enumerate() {
        for (col, px) in line.iter_mut().enumerate() {
            *px = (col + row + shift) as u8;
        }
    }
    uv_plane.fill(128);
}

impl Decoder for ReferenceCodec {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<(), CodecError> {
        if self.running {
            return Ok(());
        }
        let frame_size = self.geometry.frame_size();
        self.inputs = vec![vec![0u8; self.input_capacity]; self.config.input_slots];
        self.input_owned = vec![false; self.config.input_slots];
        self.outputs = (0..self.config.output_slots)
            .map(|_| OutputSlot {
                data: vec![0u8; frame_size],
                info: BufferInfo {
                    offset: 0,
                    size: 0,
                    pts_us: 0,
                    flags: BufferFlags::empty(),
                },
                state: SlotState::Free,
            })
            .collect();
        self.reset_slots();
        self.running = true;
        tracing::debug!("{} started ({})", self.name, self.mime);
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> Result<Option<usize>, CodecError> {
        self.ensure_running()?;
        // Slots only free up on this thread, so waiting would never help.
        if self.input_eos {
            return Ok(None);
        }
        let index = self.free_inputs.pop_front();
        if let Some(i) = index {
            self.input_owned[i] = true;
        }
        Ok(index)
    }

    fn input_buffer(&mut self, index: usize) -> Result<&mut [u8], CodecError> {
        self.ensure_running()?;
        if !self.input_owned.get(index).copied().unwrap_or(false) {
            return Err(CodecError::InvalidIndex(index));
        }
        Ok(&mut self.inputs[index])
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        offset: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> Result<(), CodecError> {
        self.ensure_running()?;
        if !self.input_owned.get(index).copied().unwrap_or(false) {
            return Err(CodecError::InvalidIndex(index));
        }
        if offset + size > self.input_capacity {
            return Err(CodecError::Overflow {
                size: offset + size,
                capacity: self.input_capacity,
            });
        }
        if self.input_eos {
            return Err(CodecError::InputAfterEos);
        }

        self.input_owned[index] = false;
        self.free_inputs.push_back(index);
        self.pending.push_back(PendingInput {
            pts_us,
            size,
            flags,
        });
        if flags.contains(BufferFlags::END_OF_STREAM) {
            self.input_eos = true;
        }
        self.decode_pending();
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> Result<OutputStatus, CodecError> {
        self.ensure_running()?;
        self.decode_pending();

        if self.ready.is_empty() {
            return Ok(OutputStatus::TryAgainLater);
        }
        if !self.format_announced {
            self.format_announced = true;
            return Ok(OutputStatus::FormatChanged);
        }

        match self.ready.pop_front() {
            Some(index) => {
                let slot = &mut self.outputs[index];
                slot.state = SlotState::Dequeued;
                Ok(OutputStatus::Ready {
                    index,
                    info: slot.info,
                })
            }
            None => Ok(OutputStatus::TryAgainLater),
        }
    }

    fn output_buffer(&self, index: usize) -> Result<&[u8], CodecError> {
        let slot = self.dequeued_output(index)?;
        Ok(&slot.data[slot.info.offset..slot.info.offset + slot.info.size])
    }

    fn output_format(&self) -> TrackFormat {
        let mut format = TrackFormat::video(
            "video/raw",
            self.geometry.width,
            self.geometry.height,
        );
        format.color_format = Some(self.geometry.format);
        format
    }

    fn release_output_buffer(&mut self, index: usize, _render: bool) -> Result<(), CodecError> {
        self.dequeued_output(index)?;
        self.outputs[index].state = SlotState::Free;
        self.decode_pending();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodecError> {
        self.ensure_running()?;
        let dropped = self.pending.len() + self.ready.len();
        self.reset_slots();
        tracing::debug!("{} flushed ({} buffers dropped)", self.name, dropped);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CodecError> {
        if !self.running {
            return Ok(());
        }
        self.reset_slots();
        self.running = false;
        self.format_announced = false;
        self.inputs.clear();
        self.outputs.clear();
        tracing::debug!("{} stopped after {} frames", self.name, self.frame_counter);
        Ok(())
    }
}
