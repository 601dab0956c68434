//! Image-channel frame processor (C4): header + payload in, three
//! published array views out — current frame, running sum, and (when
//! refreshed) the rolling window sum.
//!
//! The byte-swap/accumulate/window/publish sequence follows spec.md §4.4
//! directly; validated against `original_source/tpx3App/src/ADTimePix.cpp`'s
//! `processImgDataLine` for the shape-mismatch-replaces-accumulator rule and
//! `__builtin_bswap16/32` for the byte order (expressed here as
//! `PixelArray::from_be_payload`, per spec.md §9's "specify as from
//! big-endian" redesign note).

use std::time::Instant;

use log::warn;

use crate::error::DriverError;
use crate::header::FrameHeader;
use crate::parambus::ParamBus;
use crate::pixel::{Accumulator, FrameBuffer, PixelArray};

/// Per-frame facts handed back to the caller (worker) so it can feed C9's
/// estimators without this module needing to know about rate/time windows.
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    /// Frame number from the header.
    pub frame_number: i64,
    /// Detector-side timestamp from the header.
    pub time_at_frame: f64,
    /// Sum of all pixels in this frame (saturating), for the total-counts
    /// running tally.
    pub frame_total: u64,
    /// Wall-clock time spent in [`ImageProcessor::process`].
    pub processing_time: std::time::Duration,
    /// Estimated resident bytes after this call (accumulator + current
    /// frame + buffered frames + scratch), per spec.md §4.9.
    pub memory_bytes: usize,
}

/// Owns the per-channel accumulator, rolling window buffer, and scratch
/// sum buffer for one image-streaming channel.
pub struct ImageProcessor {
    accumulator: Option<Accumulator>,
    buffer: FrameBuffer<PixelArray>,
    frames_to_sum: usize,
    sum_update_interval_frames: usize,
    frames_since_sum: usize,
    window_scratch: Vec<u64>,
}

impl ImageProcessor {
    /// Create a processor with the given rolling-window size and publish
    /// interval (both validated/clamped by [`crate::pixel::FrameBuffer`]).
    pub fn new(frames_to_sum: usize, sum_update_interval_frames: usize) -> Self {
        Self {
            accumulator: None,
            buffer: FrameBuffer::new(frames_to_sum),
            frames_to_sum,
            sum_update_interval_frames: sum_update_interval_frames.clamp(1, 10_000),
            frames_since_sum: 0,
            window_scratch: Vec::new(),
        }
    }

    /// Lower or raise `frames_to_sum` mid-run: trims the buffer from the
    /// head immediately and republishes the window sum (spec.md §4.4 tie-break).
    pub fn set_frames_to_sum(&mut self, n: usize, prefix: &str, bus: &dyn ParamBus) {
        self.frames_to_sum = n;
        self.buffer.set_capacity(n);
        self.recompute_and_publish_window(prefix, bus);
        self.frames_since_sum = 0;
    }

    fn recompute_and_publish_window(&mut self, prefix: &str, bus: &dyn ParamBus) {
        let len = self.window_scratch_len();
        self.window_scratch.clear();
        self.window_scratch.resize(len, 0);
        for frame in self.buffer.iter() {
            for (acc, &v) in self.window_scratch.iter_mut().zip(frame.pixels()) {
                *acc = acc.saturating_add(v);
            }
        }
        bus.publish_array_u64(&format!("{prefix}:WindowSum"), &self.window_scratch);
    }

    fn window_scratch_len(&self) -> usize {
        self.buffer
            .iter()
            .next()
            .map(|f| f.pixels().len())
            .or_else(|| self.accumulator.as_ref().map(|a| a.totals().len()))
            .unwrap_or(0)
    }

    /// Approximate resident bytes of everything this processor holds.
    fn memory_bytes(&self, current: &PixelArray) -> usize {
        let acc = self.accumulator.as_ref().map(Accumulator::memory_bytes).unwrap_or(0);
        let buffered: usize = self.buffer.iter().map(PixelArray::memory_bytes).sum();
        acc + current.memory_bytes() + buffered + self.window_scratch.len() * std::mem::size_of::<u64>()
    }

    /// Run the full C4 pipeline for one decoded frame and publish its
    /// results under `{prefix}:CurrentFrame`, `{prefix}:RunningSum`, and
    /// (when refreshed) `{prefix}:WindowSum`.
    ///
    /// When `accumulation_enabled` is false, steps 3-5 (accumulate, window,
    /// window publish) are skipped; current-frame publication still happens
    /// (spec.md §4.4 edge case).
    pub fn process(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        accumulation_enabled: bool,
        prefix: &str,
        bus: &dyn ParamBus,
    ) -> Result<ProcessOutcome, DriverError> {
        let start = Instant::now();
        let needed = header.width * header.height * header.pixel_format.bytes_per_pixel();
        if payload.len() != needed {
            return Err(DriverError::ShortPayload {
                needed,
                got: payload.len(),
            });
        }

        let frame = PixelArray::from_be_payload(header.width, header.height, header.pixel_format, payload);
        bus.publish_array_u64(&format!("{prefix}:CurrentFrame"), frame.pixels());

        if accumulation_enabled {
            let shape_changed = self
                .accumulator
                .as_ref()
                .map(|a| a.shape() != frame.shape())
                .unwrap_or(true);
            if shape_changed {
                warn!(
                    "{prefix}: accumulator shape changed to {:?}, resetting",
                    frame.shape()
                );
                self.accumulator = Some(Accumulator::new(header.width, header.height));
                self.buffer.clear();
                self.frames_since_sum = 0;
            }
            let acc = self.accumulator.as_mut().expect("just ensured Some");
            acc.add_into(&frame)?;
            bus.publish_array_u64(&format!("{prefix}:RunningSum"), acc.totals());

            self.buffer.push(frame.clone());
            self.frames_since_sum += 1;
            if self.frames_since_sum >= self.sum_update_interval_frames {
                self.recompute_and_publish_window(prefix, bus);
                self.frames_since_sum = 0;
            }
        }

        let frame_total = frame.pixels().iter().fold(0u64, |acc, &v| acc.saturating_add(v));
        let memory_bytes = self.memory_bytes(&frame);
        Ok(ProcessOutcome {
            frame_number: header.frame_number,
            time_at_frame: header.time_at_frame,
            frame_total,
            processing_time: start.elapsed(),
            memory_bytes,
        })
    }

    /// Current rolling-window capacity.
    pub fn frames_to_sum(&self) -> usize {
        self.frames_to_sum
    }

    /// Fraction of the rolling window currently occupied, used by C9's
    /// 90%-full memory-recompute trigger.
    pub fn fill_ratio(&self) -> f64 {
        self.buffer.fill_ratio()
    }

    /// Clear accumulator and window buffer, e.g. on a clean stop
    /// (spec.md §4.6).
    pub fn reset(&mut self) {
        self.accumulator = None;
        self.buffer.clear();
        self.frames_since_sum = 0;
        self.window_scratch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parambus::RecordingParamBus;
    use crate::pixel::PixelFormat;

    fn header(width: usize, height: usize, frame_number: i64) -> FrameHeader {
        FrameHeader {
            width,
            height,
            pixel_format: PixelFormat::U16,
            frame_number,
            time_at_frame: 0.0,
        }
    }

    #[test]
    fn scenario_single_uint16_frame_4x2() {
        let bus = RecordingParamBus::new();
        let mut proc = ImageProcessor::new(10, 1);
        let h = FrameHeader {
            pixel_format: PixelFormat::U16,
            time_at_frame: 1.0,
            ..header(4, 2, 7)
        };
        let payload: Vec<u8> = (1u16..=8).flat_map(|v| v.to_be_bytes()).collect();
        let outcome = proc.process(&h, &payload, true, "Img", &bus).unwrap();
        assert_eq!(outcome.frame_number, 7);
        assert_eq!(outcome.frame_total, 36);
        assert_eq!(
            bus.last_array_u64("Img:CurrentFrame"),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert_eq!(
            bus.last_array_u64("Img:RunningSum"),
            Some(vec![1, 2, 3, 4, 5, 6, 7, 8])
        );
    }

    #[test]
    fn scenario_two_uint32_frames() {
        let bus = RecordingParamBus::new();
        let mut proc = ImageProcessor::new(10, 1);
        let h = FrameHeader {
            pixel_format: PixelFormat::U32,
            ..header(2, 1, 0)
        };
        let a: Vec<u8> = [1u32, 2].iter().flat_map(|v| v.to_be_bytes()).collect();
        let b: Vec<u8> = [0xffff_ffffu32, 5].iter().flat_map(|v| v.to_be_bytes()).collect();
        proc.process(&h, &a, true, "Img", &bus).unwrap();
        proc.process(&h, &b, true, "Img", &bus).unwrap();
        assert_eq!(
            bus.last_array_u64("Img:RunningSum"),
            Some(vec![0x1_0000_0000, 7])
        );
        assert_eq!(
            bus.last_array_u64("Img:CurrentFrame"),
            Some(vec![4294967295, 5])
        );
    }

    #[test]
    fn scenario_frame_buffer_resize() {
        let bus = RecordingParamBus::new();
        let mut proc = ImageProcessor::new(3, 1);
        let h = header(1, 1, 0);
        let mut window_pixel_0 = Vec::new();
        for v in 1u16..=5 {
            proc.process(&h, &v.to_be_bytes(), true, "Img", &bus).unwrap();
            window_pixel_0.push(bus.last_array_u64("Img:WindowSum").unwrap()[0]);
        }
        assert_eq!(window_pixel_0, vec![1, 3, 6, 9, 12]);

        proc.set_frames_to_sum(2, "Img", &bus);
        assert_eq!(bus.last_array_u64("Img:WindowSum").unwrap(), vec![9]);
    }

    #[test]
    fn accumulation_disabled_skips_accumulator_but_publishes_current_frame() {
        let bus = RecordingParamBus::new();
        let mut proc = ImageProcessor::new(3, 1);
        let h = header(1, 1, 0);
        proc.process(&h, &1u16.to_be_bytes(), false, "Img", &bus).unwrap();
        assert!(bus.last_array_u64("Img:CurrentFrame").is_some());
        assert!(bus.last_array_u64("Img:RunningSum").is_none());
    }

    #[test]
    fn shape_change_resets_accumulator() {
        let bus = RecordingParamBus::new();
        let mut proc = ImageProcessor::new(3, 1);
        proc.process(&header(1, 1, 0), &1u16.to_be_bytes(), true, "Img", &bus)
            .unwrap();
        let wide = header(2, 1, 1);
        let payload: Vec<u8> = (1u16..=2).flat_map(|v| v.to_be_bytes()).collect();
        proc.process(&wide, &payload, true, "Img", &bus).unwrap();
        assert_eq!(bus.last_array_u64("Img:RunningSum"), Some(vec![1, 2]));
    }

    #[test]
    fn short_payload_is_rejected() {
        let bus = RecordingParamBus::new();
        let mut proc = ImageProcessor::new(3, 1);
        let h = header(4, 4, 0);
        let err = proc.process(&h, &[0, 1, 2], true, "Img", &bus).unwrap_err();
        assert!(matches!(err, DriverError::ShortPayload { .. }));
    }
}
