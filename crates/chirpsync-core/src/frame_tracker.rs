//! Frame-level aggregation and next-frame prediction
//!
//! Each processed capture contributes one [`FrameRecord`]: the chirp
//! estimates of that capture averaged together, plus the frame's timing
//! relative to the frames seen before it.
//!
//! ```text
//!  frame 0          frame 1          frame 2          (predicted)
//!  |▲▲▲▲            |▲▲▲▲            |▲▲▲▲            |
//!  s0               s1               s2               s2 + (s2 − s0)/2
//! ```
//!
//! Chirp slope and period averages across frames are weighted by
//! `chirp_count − 1`, which removes single-chirp frames (no period can be
//! measured from one chirp).

use serde::Serialize;

use crate::buffer::SampleBuffer;
use crate::estimation::ChirpEstimate;

/// One captured victim frame.
///
/// Column order matches the persisted frame table.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FrameRecord {
    /// Start time minus the previous frame's start (µs); 0 for the first frame
    pub duration_us: f64,
    pub chirp_count: usize,
    /// Mean slope of this frame's chirps (MHz/µs)
    pub avg_slope_mhz_per_us: f64,
    /// Mean spacing between chirp starts (µs); 0 for single-chirp frames
    pub avg_chirp_period_us: f64,
    /// Start of the first chirp (µs, device time)
    pub start_time_us: f64,
    /// Expected start of the next frame (µs); 0 for the first frame
    pub predicted_next_start_us: f64,
}

impl FrameRecord {
    /// Number of columns in the persisted table
    pub const COLUMNS: usize = 6;

    pub fn to_row(&self) -> [f64; Self::COLUMNS] {
        [
            self.duration_us,
            self.chirp_count as f64,
            self.avg_slope_mhz_per_us,
            self.avg_chirp_period_us,
            self.start_time_us,
            self.predicted_next_start_us,
        ]
    }
}

/// Snapshot of the running estimates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct FrameSummary {
    pub frames_captured: usize,
    pub avg_slope_mhz_per_us: Option<f64>,
    pub avg_chirp_period_us: Option<f64>,
    pub avg_frame_duration_us: Option<f64>,
    pub last_frame_start_us: Option<f64>,
    pub predicted_next_start_us: Option<f64>,
}

/// Append-only, capacity-bounded table of [`FrameRecord`]s.
#[derive(Debug, Clone)]
pub struct FrameTracker {
    capacity: usize,
    frames: Vec<FrameRecord>,
    slope_weighted_sum: f64,
    period_weighted_sum: f64,
    weight_sum: f64,
}

impl FrameTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            frames: Vec::with_capacity(capacity),
            slope_weighted_sum: 0.0,
            period_weighted_sum: 0.0,
            weight_sum: 0.0,
        }
    }

    /// Aggregate one frame's chirp estimates (in time order) into a record.
    ///
    /// Returns `None` without touching the table when there are no chirps or
    /// the table is full.
    pub fn record(&mut self, chirps: &[ChirpEstimate]) -> Option<FrameRecord> {
        let (first_chirp, last_chirp) = match (chirps.first(), chirps.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => return None,
        };

        if self.frames.len() >= self.capacity {
            tracing::warn!(capacity = self.capacity, "frame table full, dropping frame");
            return None;
        }

        let chirp_count = chirps.len();
        let avg_slope =
            chirps.iter().map(|c| c.slope_mhz_per_us).sum::<f64>() / chirp_count as f64;
        let avg_period = if chirp_count > 1 {
            (last_chirp.start_time_us - first_chirp.start_time_us) / (chirp_count - 1) as f64
        } else {
            0.0
        };
        let start = first_chirp.start_time_us;

        let (duration, predicted) = match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(prev)) => {
                let avg_frame = (start - first.start_time_us) / self.frames.len() as f64;
                (start - prev.start_time_us, start + avg_frame)
            }
            _ => (0.0, 0.0),
        };

        let record = FrameRecord {
            duration_us: duration,
            chirp_count,
            avg_slope_mhz_per_us: avg_slope,
            avg_chirp_period_us: avg_period,
            start_time_us: start,
            predicted_next_start_us: predicted,
        };

        let weight = (chirp_count - 1) as f64;
        self.slope_weighted_sum += avg_slope * weight;
        self.period_weighted_sum += avg_period * weight;
        self.weight_sum += weight;

        self.frames.push(record);
        Some(record)
    }

    pub fn frames(&self) -> &[FrameRecord] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last(&self) -> Option<&FrameRecord> {
        self.frames.last()
    }

    /// Slope averaged over all multi-chirp frames
    pub fn average_chirp_slope(&self) -> Option<f64> {
        (self.weight_sum > 0.0).then(|| self.slope_weighted_sum / self.weight_sum)
    }

    /// Chirp period averaged over all multi-chirp frames (µs)
    pub fn average_chirp_period_us(&self) -> Option<f64> {
        (self.weight_sum > 0.0).then(|| self.period_weighted_sum / self.weight_sum)
    }

    /// Mean spacing between frame starts (µs); needs two frames
    pub fn average_frame_duration_us(&self) -> Option<f64> {
        match (self.frames.first(), self.frames.last()) {
            (Some(first), Some(last)) if self.frames.len() > 1 => Some(
                (last.start_time_us - first.start_time_us) / (self.frames.len() - 1) as f64,
            ),
            _ => None,
        }
    }

    pub fn last_frame_start_us(&self) -> Option<f64> {
        self.frames.last().map(|f| f.start_time_us)
    }

    /// Predicted start of the next frame (µs); needs two frames
    pub fn next_frame_start_prediction_us(&self) -> Option<f64> {
        if self.frames.len() > 1 {
            self.frames.last().map(|f| f.predicted_next_start_us)
        } else {
            None
        }
    }

    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            frames_captured: self.frames.len(),
            avg_slope_mhz_per_us: self.average_chirp_slope(),
            avg_chirp_period_us: self.average_chirp_period_us(),
            avg_frame_duration_us: self.average_frame_duration_us(),
            last_frame_start_us: self.last_frame_start_us(),
            predicted_next_start_us: self.next_frame_start_prediction_us(),
        }
    }

    /// The table as `capacity × 6` values; unused rows are zero.
    pub fn to_buffer(&self) -> SampleBuffer<f64> {
        let mut table = SampleBuffer::new(self.capacity, FrameRecord::COLUMNS);
        for (i, frame) in self.frames.iter().enumerate() {
            table.row_mut(i).copy_from_slice(&frame.to_row());
        }
        table
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        self.slope_weighted_sum = 0.0;
        self.period_weighted_sum = 0.0;
        self.weight_sum = 0.0;
    }
}
