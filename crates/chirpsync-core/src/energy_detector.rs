//! Chirp Presence Detection via Row Energy
//!
//! The sensing radio streams one row of samples at a time into a small ring
//! (the [`ChirpDetectionWindow`]). Each new row's power is compared against a
//! noise floor measured once during a quiet calibration capture:
//!
//! ```text
//! power_dB = 10·log10( Σ(re² + im²) / (N / fs) )
//!
//! chirp present  ⇔  power_dB − noise_dB ≥ threshold_dB
//! ```
//!
//! While no chirp is present the cursor walks around the ring, so the rows
//! just before a trigger are still available. When a row triggers, the
//! cursor stays on it and the caller copies the pre-trigger history plus the
//! triggering row into the spectrogram capture buffer.
//!
//! ```text
//!  ring (K = 3)     ┌────────┬────────┬────────┐
//!                   │ row 0  │ row 1  │ row 2  │
//!                   └────────┴────────┴────────┘
//!                        ▲ history   ▲ cursor (triggered)
//!  capture buffer:  [ row 0 | row 1 | rows received afterwards ... ]
//! ```

use crate::buffer::{BufferViewMut, SampleBuffer};
use crate::config::ExperimentConfig;
use crate::types::{to_db, IQSample};

// ---------------------------------------------------------------------------
// ChirpDetectionWindow
// ---------------------------------------------------------------------------

/// Ring of the K most recent capture rows with their timestamps.
#[derive(Debug, Clone)]
pub struct ChirpDetectionWindow {
    rows: SampleBuffer<IQSample>,
    /// Device time of the first sample of each row (µs)
    timestamps_us: Vec<f64>,
    cursor: usize,
    /// Rows received and examined since the last reset
    filled: usize,
}

impl ChirpDetectionWindow {
    pub fn new(num_rows: usize, samples_per_row: usize) -> Self {
        let num_rows = num_rows.max(1);
        Self {
            rows: SampleBuffer::new(num_rows, samples_per_row),
            timestamps_us: vec![0.0; num_rows],
            cursor: 0,
            filled: 0,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.rows()
    }

    pub fn samples_per_row(&self) -> usize {
        self.rows.cols()
    }

    /// Row currently under examination
    pub fn current_index(&self) -> usize {
        self.cursor
    }

    pub fn row(&self, index: usize) -> &[IQSample] {
        self.rows.row(index)
    }

    pub fn timestamp_us(&self, index: usize) -> f64 {
        self.timestamps_us[index]
    }

    /// Single-row view at the cursor, for the receiver to fill.
    pub fn current_view_mut(&mut self) -> BufferViewMut<'_, IQSample> {
        let cols = self.rows.cols();
        BufferViewMut::from_slice(self.rows.row_mut(self.cursor), cols)
    }

    pub fn set_current_timestamp_us(&mut self, time_us: f64) {
        self.timestamps_us[self.cursor] = time_us;
    }

    /// Move the cursor to the next slot, wrapping modulo K.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.num_rows();
        self.filled = (self.filled + 1).min(self.num_rows());
    }

    /// Number of valid rows before the cursor
    pub fn history_len(&self) -> usize {
        self.filled.min(self.num_rows() - 1)
    }

    /// Index of the oldest row that belongs to the current capture
    fn oldest_index(&self) -> usize {
        let k = self.num_rows();
        (self.cursor + k - self.history_len()) % k
    }

    /// Zero every row and timestamp and return the cursor to slot 0.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.timestamps_us.fill(0.0);
        self.cursor = 0;
        self.filled = 0;
    }
}

// ---------------------------------------------------------------------------
// EnergyDetector
// ---------------------------------------------------------------------------

/// Noise-floor calibrated energy detector over a [`ChirpDetectionWindow`].
#[derive(Debug, Clone)]
pub struct EnergyDetector {
    sample_rate: f64,
    threshold_db: f64,
    relative_noise_power_db: f64,
    window: ChirpDetectionWindow,
}

impl EnergyDetector {
    /// Create a detector whose window keeps `pre_trigger_rows` rows of
    /// history ahead of the triggering row.
    pub fn new(
        sample_rate: f64,
        threshold_db: f64,
        pre_trigger_rows: usize,
        samples_per_row: usize,
    ) -> Self {
        Self {
            sample_rate,
            threshold_db,
            relative_noise_power_db: 0.0,
            window: ChirpDetectionWindow::new(pre_trigger_rows + 1, samples_per_row),
        }
    }

    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self::new(
            config.radio.sample_rate,
            config.sensing.energy_detection_threshold_db,
            config.sensing.pre_trigger_rows,
            config.radio.rx_samples_per_buffer,
        )
    }

    /// Power of `samples` in dB relative to 1 unit²/s.
    ///
    /// Returns `None` for an empty slice.
    pub fn signal_power_db(&self, samples: &[IQSample]) -> Option<f64> {
        if samples.is_empty() {
            return None;
        }

        let duration_s = samples.len() as f64 / self.sample_rate;
        let energy: f64 = samples.iter().map(|s| s.re * s.re + s.im * s.im).sum();
        Some(to_db(energy / duration_s))
    }

    /// Measure the noise floor over a quiet capture and keep it.
    ///
    /// A silent capture measures `-inf`; it is returned but not kept, since
    /// every later row would clear the threshold.
    pub fn calibrate(&mut self, samples: &[IQSample]) -> Option<f64> {
        let power = self.signal_power_db(samples)?;
        if !power.is_finite() {
            return Some(power);
        }
        self.relative_noise_power_db = power;
        tracing::debug!(noise_db = power, samples = samples.len(), "noise floor calibrated");
        Some(power)
    }

    pub fn relative_noise_power_db(&self) -> f64 {
        self.relative_noise_power_db
    }

    pub fn threshold_db(&self) -> f64 {
        self.threshold_db
    }

    /// Test the row at `current_index` for a chirp.
    ///
    /// On a miss the cursor advances; on a hit it stays on the row so the
    /// capture can be read out.
    pub fn check_for_chirp(&mut self, current_index: usize) -> bool {
        let detected = match self.signal_power_db(self.window.row(current_index)) {
            Some(power) => power - self.relative_noise_power_db >= self.threshold_db,
            None => false,
        };

        if !detected {
            self.window.advance();
        }
        detected
    }

    pub fn window(&self) -> &ChirpDetectionWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut ChirpDetectionWindow {
        &mut self.window
    }

    /// Device time of the first sample handed to the spectrogram (µs)
    pub fn detection_start_time_us(&self) -> f64 {
        self.window.timestamp_us(self.window.oldest_index())
    }

    /// Copy the pre-trigger history and the triggering row, oldest first,
    /// into the leading rows of `dest`. Returns the number of rows written.
    pub fn save_capture_to(&self, dest: &mut BufferViewMut<'_, IQSample>) -> usize {
        let k = self.window.num_rows();
        let count = (self.window.history_len() + 1).min(dest.rows());
        let oldest = self.window.oldest_index();

        for i in 0..count {
            let src = self.window.row((oldest + i) % k);
            let dst = dest.row_mut(i);
            let n = src.len().min(dst.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
        count
    }

    /// Clear the window. The noise floor is kept.
    pub fn reset(&mut self) {
        self.window.reset();
    }
}
