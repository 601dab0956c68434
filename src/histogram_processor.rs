//! Histogram-channel frame processor (C5): the same shape as
//! [`crate::image_processor`] over [`crate::pixel::BinArray`] instead of
//! [`crate::pixel::PixelArray`], per spec.md §9's "three instantiations of
//! the same generic streaming channel."
//!
//! Edges are recomputed only when `(bin_size, bin_width, bin_offset)`
//! change (spec.md §4.5), validated against `histogram_io.cpp`'s
//! `calculate_bin_edges`.

use std::time::Instant;

use log::warn;

use crate::error::DriverError;
use crate::header::HistogramHeader;
use crate::parambus::ParamBus;
use crate::pixel::{BinArray, FrameBuffer};

/// Per-frame facts handed back to the caller, mirroring
/// [`crate::image_processor::ProcessOutcome`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    /// Frame number from the header.
    pub frame_number: i64,
    /// Detector-side timestamp from the header.
    pub time_at_frame: f64,
    /// Sum of all bin counts in this frame (saturating).
    pub frame_total: u64,
    /// Wall-clock time spent in [`HistogramProcessor::process`].
    pub processing_time: std::time::Duration,
    /// Estimated resident bytes after this call.
    pub memory_bytes: usize,
}

/// Owns the per-channel accumulator, rolling window buffer, and scratch
/// sum buffer for one histogram-streaming channel.
pub struct HistogramProcessor {
    accumulator: Option<BinArray>,
    buffer: FrameBuffer<BinArray>,
    frames_to_sum: usize,
    sum_update_interval_frames: usize,
    frames_since_sum: usize,
    window_scratch: Vec<u64>,
    edge_params: Option<(i64, i64)>,
}

impl HistogramProcessor {
    /// Create a processor with the given rolling-window size and publish
    /// interval.
    pub fn new(frames_to_sum: usize, sum_update_interval_frames: usize) -> Self {
        Self {
            accumulator: None,
            buffer: FrameBuffer::new(frames_to_sum),
            frames_to_sum,
            sum_update_interval_frames: sum_update_interval_frames.clamp(1, 10_000),
            frames_since_sum: 0,
            window_scratch: Vec::new(),
            edge_params: None,
        }
    }

    /// Lower or raise `frames_to_sum` mid-run, same tie-break as C4.
    pub fn set_frames_to_sum(&mut self, n: usize, prefix: &str, bus: &dyn ParamBus) {
        self.frames_to_sum = n;
        self.buffer.set_capacity(n);
        self.recompute_and_publish_window(prefix, bus);
        self.frames_since_sum = 0;
    }

    fn recompute_and_publish_window(&mut self, prefix: &str, bus: &dyn ParamBus) {
        let len = self
            .buffer
            .iter()
            .next()
            .map(BinArray::bin_count)
            .or_else(|| self.accumulator.as_ref().map(BinArray::bin_count))
            .unwrap_or(0);
        self.window_scratch.clear();
        self.window_scratch.resize(len, 0);
        for frame in self.buffer.iter() {
            for (acc, &v) in self.window_scratch.iter_mut().zip(frame.counts()) {
                *acc = acc.saturating_add(v);
            }
        }
        bus.publish_array_u64(&format!("{prefix}:WindowSum"), &self.window_scratch);
    }

    fn memory_bytes(&self, current: &BinArray) -> usize {
        let acc = self.accumulator.as_ref().map(BinArray::memory_bytes).unwrap_or(0);
        let buffered: usize = self.buffer.iter().map(BinArray::memory_bytes).sum();
        acc + current.memory_bytes() + buffered + self.window_scratch.len() * std::mem::size_of::<u64>()
    }

    /// Run the full C5 pipeline for one decoded histogram frame.
    pub fn process(
        &mut self,
        header: &HistogramHeader,
        payload: &[u8],
        accumulation_enabled: bool,
        prefix: &str,
        bus: &dyn ParamBus,
    ) -> Result<ProcessOutcome, DriverError> {
        let start = Instant::now();
        let needed = header.bin_size * 4;
        if payload.len() != needed {
            return Err(DriverError::ShortPayload {
                needed,
                got: payload.len(),
            });
        }

        let mut frame = BinArray::from_be_payload(header.bin_size, payload);
        let params = (header.bin_width, header.bin_offset);
        if self.edge_params != Some(params) {
            frame.set_edges(header.bin_width, header.bin_offset);
            self.edge_params = Some(params);
            bus.publish_array_f64(&format!("{prefix}:BinCenters"), &frame.centers_ms());
        }
        bus.publish_array_u64(&format!("{prefix}:CurrentFrame"), frame.counts());

        if accumulation_enabled {
            let shape_changed = self
                .accumulator
                .as_ref()
                .map(|a| a.bin_count() != frame.bin_count())
                .unwrap_or(true);
            if shape_changed {
                warn!("{prefix}: accumulator bin count changed to {}, resetting", frame.bin_count());
                let mut acc = BinArray::new(frame.bin_count());
                acc.set_edges(header.bin_width, header.bin_offset);
                self.accumulator = Some(acc);
                self.buffer.clear();
                self.frames_since_sum = 0;
            }
            let acc = self.accumulator.as_mut().expect("just ensured Some");
            acc.add_into(&frame)?;
            bus.publish_array_u64(&format!("{prefix}:RunningSum"), acc.counts());

            self.buffer.push(frame.clone());
            self.frames_since_sum += 1;
            if self.frames_since_sum >= self.sum_update_interval_frames {
                self.recompute_and_publish_window(prefix, bus);
                self.frames_since_sum = 0;
            }
        }

        let frame_total = frame.counts().iter().fold(0u64, |acc, &v| acc.saturating_add(v));
        let memory_bytes = self.memory_bytes(&frame);
        Ok(ProcessOutcome {
            frame_number: header.frame_number,
            time_at_frame: header.time_at_frame,
            frame_total,
            processing_time: start.elapsed(),
            memory_bytes,
        })
    }

    /// Fraction of the rolling window currently occupied, used by C9's
    /// 90%-full memory-recompute trigger.
    pub fn fill_ratio(&self) -> f64 {
        self.buffer.fill_ratio()
    }

    /// Clear accumulator and window buffer, e.g. on a clean stop.
    pub fn reset(&mut self) {
        self.accumulator = None;
        self.buffer.clear();
        self.frames_since_sum = 0;
        self.window_scratch.clear();
        self.edge_params = None;
    }
}
