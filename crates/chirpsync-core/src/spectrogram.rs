//! Spectrogram-Based Victim Waveform Estimation
//!
//! Every capture handed over by the energy detector runs through five stages,
//! strictly in order:
//!
//! ```text
//!  capture (R × spb I/Q)
//!     │ 1. reshape into fft_size windows (stride samples_per_window), × Hann
//!     ▼
//!  windowed (rows × fft_size)
//!     │ 2. forward FFT, 10·log10|X|
//!     ▼
//!  spectrogram (rows × fft_size, dB)
//!     │ 3. strongest bin per row, kept if > global max − threshold
//!     ▼
//!  detected points (t µs, f MHz)
//!     │ 4. strictly rising runs → cluster ids
//!     ▼
//!  clusters
//!     │ 5. least squares per cluster → slope, start time → FrameRecord
//!     ▼
//!  frame tracker (prediction of the next frame start)
//! ```
//!
//! ## Geometry
//!
//! The time resolution target is 2 µs (0.5 µs above 500 MSps). The number of
//! samples covering that period is the window stride; the FFT size is the
//! largest power of two not exceeding it. All axes and buffers are sized once
//! at construction and overwritten in place on every capture.

use std::path::{Path, PathBuf};

use crate::buffer::{BufferError, SampleBuffer};
use crate::config::{ConfigError, ExperimentConfig};
use crate::estimation::{assign_clusters, fit_line, ChirpEstimate};
use crate::fft_utils::{find_peak, magnitude_db, FftProcessor};
use crate::frame_tracker::{FrameRecord, FrameTracker};
use crate::io::write_raw_file;
use crate::types::{IQSample, SPEED_OF_LIGHT};

pub const HANN_WINDOW_FILE: &str = "hann_window.bin";
pub const WINDOWED_FILE: &str = "reshaped_and_windowed.bin";
pub const SPECTROGRAM_FILE: &str = "spectrogram.bin";
pub const PEAK_VALUES_FILE: &str = "spectrogram_peaks.bin";
pub const DETECTED_TIMES_FILE: &str = "detected_times.bin";
pub const DETECTED_FREQUENCIES_FILE: &str = "detected_frequencies.bin";
pub const CLUSTER_IDS_FILE: &str = "cluster_ids.bin";
pub const DETECTED_SLOPES_FILE: &str = "detected_slopes.bin";
pub const DETECTED_INTERCEPTS_FILE: &str = "detected_intercepts.bin";
pub const CAPTURED_FRAMES_FILE: &str = "captured_frames.bin";

/// `ceil` that treats values within rounding noise of an integer as that
/// integer, so `2.048e9 · 0.5e-6` sizes a 1024-sample window.
fn ceil_snapped(x: f64) -> usize {
    let rounded = x.round();
    if (x - rounded).abs() < 1e-9 * rounded.abs().max(1.0) {
        rounded as usize
    } else {
        x.ceil() as usize
    }
}

/// Hann window `w[n] = 0.5·(1 − cos(2πn/(M−1)))`.
pub fn hann_window(m: usize) -> Vec<f64> {
    if m <= 1 {
        return vec![1.0; m];
    }
    let denom = (m - 1) as f64;
    (0..m)
        .map(|n| 0.5 * (1.0 - (2.0 * std::f64::consts::PI * n as f64 / denom).cos()))
        .collect()
}

// ---------------------------------------------------------------------------
// Configuration and geometry
// ---------------------------------------------------------------------------

/// Parameters of the spectrogram handler.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramConfig {
    /// Sample rate (Hz)
    pub sample_rate: f64,
    /// Samples per received row
    pub rx_samples_per_buffer: usize,
    /// Minimum capture length (ms)
    pub min_recording_time_ms: f64,
    /// Peaks below `max − threshold` are dropped (dB)
    pub peak_threshold_db: f64,
    pub min_points_per_chirp: usize,
    /// Capacity of the frame table
    pub max_frames_to_capture: usize,
    /// Run the FFT stage on the rayon pool
    pub parallel_fft: bool,
}

impl SpectrogramConfig {
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            sample_rate: config.radio.sample_rate,
            rx_samples_per_buffer: config.radio.rx_samples_per_buffer,
            min_recording_time_ms: config.sensing.min_recording_time_ms,
            peak_threshold_db: config.sensing.spectrogram_peak_threshold_db,
            min_points_per_chirp: config.sensing.min_points_per_chirp,
            max_frames_to_capture: config.sensing.max_frames_to_capture,
            parallel_fft: config.sensing.parallel_fft,
        }
    }
}

/// Sizes and axis spacing derived from the sample rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectrogramGeometry {
    /// Stride between consecutive FFT windows (samples)
    pub samples_per_window: usize,
    /// FFT length (power of two ≤ `samples_per_window`)
    pub fft_size: usize,
    /// Rows of `rx_samples_per_buffer` in one capture
    pub capture_rows: usize,
    /// Samples in one capture
    pub capture_samples: usize,
    /// Time bins in the spectrogram
    pub spectrogram_rows: usize,
    /// Frequency bin spacing (MHz)
    pub frequency_resolution_mhz: f64,
    /// Time bin spacing (µs)
    pub window_period_us: f64,
    /// Time of the first bin's centre relative to the capture start (µs)
    pub time_offset_us: f64,
}

impl SpectrogramGeometry {
    pub fn new(
        sample_rate: f64,
        rx_samples_per_buffer: usize,
        min_recording_time_ms: f64,
    ) -> Result<Self, ConfigError> {
        if sample_rate <= 0.0 || rx_samples_per_buffer == 0 {
            return Err(ConfigError::Invalid(
                "spectrogram needs a positive sample rate and row length".to_string(),
            ));
        }

        let target_period_s = if sample_rate > 500e6 { 0.5e-6 } else { 2e-6 };
        let samples_per_window = ceil_snapped(sample_rate * target_period_s);
        if samples_per_window < 2 {
            return Err(ConfigError::Invalid(format!(
                "sample rate {} Hz gives fewer than 2 samples per spectrogram window",
                sample_rate
            )));
        }
        let fft_size = 1usize << samples_per_window.ilog2();

        let row_period_s = rx_samples_per_buffer as f64 / sample_rate;
        let capture_rows = ceil_snapped(min_recording_time_ms * 1e-3 / row_period_s);
        let capture_samples = capture_rows * rx_samples_per_buffer;
        let spectrogram_rows = capture_samples / samples_per_window;
        if spectrogram_rows == 0 {
            return Err(ConfigError::Invalid(format!(
                "recording time {} ms is shorter than one spectrogram window",
                min_recording_time_ms
            )));
        }

        let fs_mhz = sample_rate * 1e-6;
        let window_period_us = samples_per_window as f64 / fs_mhz;

        Ok(Self {
            samples_per_window,
            fft_size,
            capture_rows,
            capture_samples,
            spectrogram_rows,
            frequency_resolution_mhz: fs_mhz / fft_size as f64,
            window_period_us,
            time_offset_us: window_period_us * (fft_size / 2) as f64 / samples_per_window as f64,
        })
    }

    /// Centre frequency of every FFT bin (MHz)
    pub fn frequencies_mhz(&self) -> Vec<f64> {
        (0..self.fft_size)
            .map(|i| self.frequency_resolution_mhz * i as f64)
            .collect()
    }

    /// Time of every spectrogram row relative to the capture start (µs)
    pub fn times_us(&self) -> Vec<f64> {
        (0..self.spectrogram_rows)
            .map(|i| self.window_period_us * i as f64 + self.time_offset_us)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// SpectrogramHandler
// ---------------------------------------------------------------------------

/// Turns raw captures into chirp estimates and frame predictions.
#[derive(Debug)]
pub struct SpectrogramHandler {
    config: SpectrogramConfig,
    geometry: SpectrogramGeometry,
    fft: FftProcessor,

    hann: Vec<f64>,
    frequencies_mhz: Vec<f64>,
    times_us: Vec<f64>,

    capture: SampleBuffer<IQSample>,
    windowed: SampleBuffer<IQSample>,
    spectrum: SampleBuffer<IQSample>,
    spectrogram: SampleBuffer<f64>,

    peak_bins: Vec<usize>,
    peak_values: Vec<f64>,
    detected_times: Vec<f64>,
    detected_freqs: Vec<f64>,
    num_detected: usize,
    cluster_ids: Vec<i32>,
    slopes: Vec<f64>,
    intercepts: Vec<f64>,
    chirps: Vec<ChirpEstimate>,

    detection_start_time_us: f64,
    tracker: FrameTracker,
}

impl SpectrogramHandler {
    pub fn new(config: SpectrogramConfig) -> Result<Self, ConfigError> {
        let geometry = SpectrogramGeometry::new(
            config.sample_rate,
            config.rx_samples_per_buffer,
            config.min_recording_time_ms,
        )?;

        if config.parallel_fft && cfg!(not(feature = "parallel")) {
            tracing::warn!("parallel FFT requested but the `parallel` feature is disabled");
        }

        let rows = geometry.spectrogram_rows;
        let fft_size = geometry.fft_size;

        tracing::debug!(
            fft_size,
            samples_per_window = geometry.samples_per_window,
            capture_rows = geometry.capture_rows,
            spectrogram_rows = rows,
            "spectrogram geometry"
        );

        Ok(Self {
            fft: FftProcessor::new(fft_size),
            hann: hann_window(fft_size),
            frequencies_mhz: geometry.frequencies_mhz(),
            times_us: geometry.times_us(),
            capture: SampleBuffer::new(geometry.capture_rows, config.rx_samples_per_buffer),
            windowed: SampleBuffer::new(rows, fft_size),
            spectrum: SampleBuffer::new(rows, fft_size),
            spectrogram: SampleBuffer::new(rows, fft_size),
            peak_bins: vec![0; rows],
            peak_values: vec![0.0; rows],
            detected_times: vec![0.0; rows],
            detected_freqs: vec![0.0; rows],
            num_detected: 0,
            cluster_ids: vec![0; rows],
            slopes: vec![0.0; rows],
            intercepts: vec![0.0; rows],
            chirps: Vec::with_capacity(rows),
            detection_start_time_us: 0.0,
            tracker: FrameTracker::new(config.max_frames_to_capture),
            geometry,
            config,
        })
    }

    pub fn from_config(config: &ExperimentConfig) -> Result<Self, ConfigError> {
        Self::new(SpectrogramConfig::from_config(config))
    }

    pub fn geometry(&self) -> &SpectrogramGeometry {
        &self.geometry
    }

    /// Raw capture consumed by the next [`process_received_signal`](Self::process_received_signal)
    pub fn capture(&self) -> &SampleBuffer<IQSample> {
        &self.capture
    }

    pub fn capture_mut(&mut self) -> &mut SampleBuffer<IQSample> {
        &mut self.capture
    }

    /// Record the device time of the first captured sample, removing the
    /// one-way propagation delay from a victim `victim_distance_m` away.
    pub fn set_detection_start_time_us(&mut self, start_time_us: f64, victim_distance_m: f64) {
        let delay_us = victim_distance_m / SPEED_OF_LIGHT * 1e6;
        self.detection_start_time_us = start_time_us - delay_us;
    }

    pub fn detection_start_time_us(&self) -> f64 {
        self.detection_start_time_us
    }

    /// Run all five stages on the current capture.
    ///
    /// Returns the new frame record, or `None` when the capture holds no
    /// usable chirp (nothing is appended to the frame table in that case).
    pub fn process_received_signal(&mut self) -> Option<FrameRecord> {
        self.load_and_window();
        self.compute_ffts();
        self.detect_peaks();

        if self.num_detected == 0 {
            tracing::warn!("no spectrogram peaks above threshold, skipping frame");
            return None;
        }

        let clusters = assign_clusters(
            &self.detected_freqs[..self.num_detected],
            self.config.min_points_per_chirp,
            &mut self.cluster_ids,
        );
        self.compute_linear_models(&clusters);

        if self.chirps.is_empty() {
            tracing::warn!(
                points = self.num_detected,
                "no valid chirp clusters in capture, skipping frame"
            );
            return None;
        }

        let record = self.tracker.record(&self.chirps)?;
        tracing::debug!(
            chirps = record.chirp_count,
            slope = record.avg_slope_mhz_per_us,
            start_us = record.start_time_us,
            predicted_us = record.predicted_next_start_us,
            "frame captured"
        );
        Some(record)
    }

    // ----------------------------------------------------------------
    // Stage 1: reshape + window
    // ----------------------------------------------------------------

    fn load_and_window(&mut self) {
        let source = self.capture.as_slice();
        let stride = self.geometry.samples_per_window;
        let fft_size = self.geometry.fft_size;

        for row in 0..self.geometry.spectrogram_rows {
            let base = row * stride;
            let dst = self.windowed.row_mut(row);
            for (n, (out, &w)) in dst.iter_mut().zip(&self.hann).enumerate() {
                let idx = base + n;
                *out = if idx < source.len() {
                    source[idx] * w
                } else {
                    IQSample::new(0.0, 0.0)
                };
            }
            debug_assert_eq!(dst.len(), fft_size);
        }
    }

    // ----------------------------------------------------------------
    // Stage 2: FFT → dB
    // ----------------------------------------------------------------

    fn compute_ffts(&mut self) {
        self.spectrum
            .as_mut_slice()
            .copy_from_slice(self.windowed.as_slice());

        #[cfg(feature = "parallel")]
        if self.config.parallel_fft {
            self.compute_ffts_parallel();
            return;
        }

        for row in 0..self.geometry.spectrogram_rows {
            let spectrum = self.spectrum.row_mut(row);
            self.fft.fft_inplace(spectrum);
            magnitude_db(spectrum, self.spectrogram.row_mut(row));
        }
    }

    #[cfg(feature = "parallel")]
    fn compute_ffts_parallel(&mut self) {
        use rayon::prelude::*;

        let fft_size = self.geometry.fft_size;
        let plan = self.fft.plan();

        self.spectrum
            .as_mut_slice()
            .par_chunks_mut(fft_size)
            .zip(self.spectrogram.as_mut_slice().par_chunks_mut(fft_size))
            .for_each(|(spectrum, db)| {
                plan.process(spectrum);
                magnitude_db(spectrum, db);
            });
    }

    // ----------------------------------------------------------------
    // Stage 3: peak extraction
    // ----------------------------------------------------------------

    fn detect_peaks(&mut self) {
        let fft_size = self.geometry.fft_size;
        for ((row, bin), value) in self
            .spectrogram
            .as_slice()
            .chunks_exact(fft_size)
            .zip(self.peak_bins.iter_mut())
            .zip(self.peak_values.iter_mut())
        {
            (*bin, *value) = find_peak(row);
        }

        let (_, global_max) = find_peak(&self.peak_values);
        let threshold = global_max - self.config.peak_threshold_db;

        self.num_detected = 0;
        self.detected_times.fill(0.0);
        self.detected_freqs.fill(0.0);
        for ((&time_us, &value), &bin) in self
            .times_us
            .iter()
            .zip(&self.peak_values)
            .zip(&self.peak_bins)
        {
            if value > threshold {
                self.detected_times[self.num_detected] = time_us;
                self.detected_freqs[self.num_detected] = self.frequencies_mhz[bin];
                self.num_detected += 1;
            }
        }
    }

    // ----------------------------------------------------------------
    // Stage 5: regression
    // ----------------------------------------------------------------

    fn compute_linear_models(&mut self, clusters: &[std::ops::Range<usize>]) {
        self.chirps.clear();
        self.slopes.fill(0.0);
        self.intercepts.fill(0.0);

        for range in clusters {
            let fit = fit_line(
                &self.detected_times[range.clone()],
                &self.detected_freqs[range.clone()],
            );
            match fit.and_then(|f| ChirpEstimate::from_fit(&f, self.detection_start_time_us)) {
                Some(chirp) => {
                    let i = self.chirps.len();
                    self.slopes[i] = chirp.slope_mhz_per_us;
                    self.intercepts[i] = chirp.start_time_us;
                    self.chirps.push(chirp);
                }
                None => tracing::warn!(
                    points = range.len(),
                    "degenerate chirp fit, cluster skipped"
                ),
            }
        }
    }

    // ----------------------------------------------------------------
    // Accessors
    // ----------------------------------------------------------------

    pub fn hann(&self) -> &[f64] {
        &self.hann
    }

    pub fn frequencies_mhz(&self) -> &[f64] {
        &self.frequencies_mhz
    }

    pub fn times_us(&self) -> &[f64] {
        &self.times_us
    }

    pub fn windowed(&self) -> &SampleBuffer<IQSample> {
        &self.windowed
    }

    pub fn spectrogram(&self) -> &SampleBuffer<f64> {
        &self.spectrogram
    }

    /// Retained (time µs, frequency MHz) points of the last capture
    pub fn detected_points(&self) -> (&[f64], &[f64]) {
        (
            &self.detected_times[..self.num_detected],
            &self.detected_freqs[..self.num_detected],
        )
    }

    /// Strongest FFT bin of every spectrogram row
    pub fn peak_bins(&self) -> &[usize] {
        &self.peak_bins
    }

    /// Cluster id per detected point (0 past the last point)
    pub fn cluster_ids(&self) -> &[i32] {
        &self.cluster_ids
    }

    /// Chirps fitted in the last capture
    pub fn chirp_estimates(&self) -> &[ChirpEstimate] {
        &self.chirps
    }

    pub fn frame_tracker(&self) -> &FrameTracker {
        &self.tracker
    }

    pub fn last_frame_start_time_us(&self) -> Option<f64> {
        self.tracker.last_frame_start_us()
    }

    /// Predicted start of the next victim frame (ms, device time)
    pub fn next_frame_start_prediction_ms(&self) -> Option<f64> {
        self.tracker.next_frame_start_prediction_us().map(|us| us * 1e-3)
    }

    /// Forget every frame and clear the capture. Geometry is kept.
    pub fn reset(&mut self) {
        self.tracker.reset();
        self.capture.clear();
        self.chirps.clear();
        self.num_detected = 0;
        self.detection_start_time_us = 0.0;
    }

    /// Log the running estimates.
    pub fn log_summary(&self) {
        let summary = self.tracker.summary();
        tracing::info!(
            frames = summary.frames_captured,
            avg_slope_mhz_per_us = ?summary.avg_slope_mhz_per_us,
            avg_chirp_period_us = ?summary.avg_chirp_period_us,
            avg_frame_duration_us = ?summary.avg_frame_duration_us,
            "estimated victim parameters"
        );
        for (i, frame) in self.tracker.frames().iter().enumerate() {
            tracing::debug!(
                frame = i,
                duration_us = frame.duration_us,
                chirps = frame.chirp_count,
                slope = frame.avg_slope_mhz_per_us,
                chirp_period_us = frame.avg_chirp_period_us,
                start_us = frame.start_time_us,
                predicted_us = frame.predicted_next_start_us,
                "frame"
            );
        }
    }

    /// Dump every intermediate buffer of the last capture into `dir`.
    pub fn save_state(&self, dir: &Path) -> Result<(), BufferError> {
        std::fs::create_dir_all(dir)?;
        write_raw_file(dir.join(HANN_WINDOW_FILE), &self.hann)?;
        self.windowed.write_raw(dir.join(WINDOWED_FILE))?;
        self.spectrogram.write_raw(dir.join(SPECTROGRAM_FILE))?;
        write_raw_file(dir.join(PEAK_VALUES_FILE), &self.peak_values)?;
        write_raw_file(dir.join(DETECTED_TIMES_FILE), &self.detected_times)?;
        write_raw_file(dir.join(DETECTED_FREQUENCIES_FILE), &self.detected_freqs)?;
        write_raw_file(dir.join(CLUSTER_IDS_FILE), &self.cluster_ids)?;
        write_raw_file(dir.join(DETECTED_SLOPES_FILE), &self.slopes)?;
        write_raw_file(dir.join(DETECTED_INTERCEPTS_FILE), &self.intercepts)?;
        self.tracker.to_buffer().write_raw(dir.join(CAPTURED_FRAMES_FILE))?;
        tracing::debug!(dir = %dir.display(), "spectrogram state saved");
        Ok(())
    }

    /// Write the frame table for one run. Repeated experiments get a
    /// run-numbered file each.
    pub fn save_estimated_parameters(
        &self,
        dir: &Path,
        run_number: Option<usize>,
    ) -> Result<PathBuf, BufferError> {
        std::fs::create_dir_all(dir)?;
        let name = match run_number {
            Some(run) => format!("estimated_parameters_{}.bin", run),
            None => "estimated_parameters.bin".to_string(),
        };
        let path = dir.join(name);
        self.tracker.to_buffer().write_raw(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    /// 16 MSps, 64-sample rows, 32 µs: stride = fft = 32, 16 time bins
    fn small_config() -> SpectrogramConfig {
        SpectrogramConfig {
            sample_rate: 16e6,
            rx_samples_per_buffer: 64,
            min_recording_time_ms: 0.032,
            peak_threshold_db: 3.0,
            min_points_per_chirp: 3,
            max_frames_to_capture: 4,
            parallel_fft: false,
        }
    }

    /// 2.048 GSps, 1024-sample rows, 2 µs: 4 rows of 1024
    fn wideband_config() -> SpectrogramConfig {
        SpectrogramConfig {
            sample_rate: 2.048e9,
            rx_samples_per_buffer: 1024,
            min_recording_time_ms: 0.002,
            peak_threshold_db: 10.0,
            min_points_per_chirp: 3,
            max_frames_to_capture: 4,
            parallel_fft: false,
        }
    }

    /// Linear chirp `f(t) = f0 + k·t` sampled at `fs` for `n` samples.
    fn chirp(fs: f64, f0_hz: f64, k_hz_per_s: f64, n: usize) -> Vec<IQSample> {
        (0..n)
            .map(|i| {
                let t = i as f64 / fs;
                IQSample::from_polar(1.0, 2.0 * PI * (f0_hz * t + 0.5 * k_hz_per_s * t * t))
            })
            .collect()
    }

    #[test]
    fn test_hann_window_shape() {
        let m = 1024;
        let w = hann_window(m);

        assert_eq!(w[0], 0.0);
        assert!(w[m - 1].abs() < 1e-12);

        let (peak_idx, peak) = find_peak(&w);
        assert_relative_eq!(peak, 1.0, epsilon = 1e-5);
        assert!(peak_idx == m / 2 - 1 || peak_idx == m / 2);
        // Single maximum: strictly rising then strictly falling
        assert!(w[..m / 2].windows(2).all(|p| p[1] > p[0]));
        assert!(w[m / 2..].windows(2).all(|p| p[1] < p[0]));

        let odd = hann_window(9);
        assert_eq!(odd[4], 1.0);
        assert_eq!(hann_window(1), vec![1.0]);
    }

    #[test]
    fn test_geometry() {
        let g = SpectrogramGeometry::new(16e6, 64, 0.032).unwrap();
        assert_eq!(g.samples_per_window, 32);
        assert_eq!(g.fft_size, 32);
        assert_eq!(g.capture_rows, 8);
        assert_eq!(g.spectrogram_rows, 16);
        assert_relative_eq!(g.frequency_resolution_mhz, 0.5);
        assert_relative_eq!(g.window_period_us, 2.0);
        assert_relative_eq!(g.time_offset_us, 1.0);

        // 25 MSps: 50-sample stride, 32-point FFT
        let g = SpectrogramGeometry::new(25e6, 2000, 0.3).unwrap();
        assert_eq!(g.samples_per_window, 50);
        assert_eq!(g.fft_size, 32);
        assert_eq!(g.capture_rows, 4);
        assert_eq!(g.spectrogram_rows, 160);
        assert_relative_eq!(g.time_offset_us, 2.0 * 16.0 / 50.0);

        let g = SpectrogramGeometry::new(2.048e9, 1024, 0.002).unwrap();
        assert_eq!(g.samples_per_window, 1024);
        assert_eq!(g.fft_size, 1024);
        assert_eq!(g.capture_rows, 4);
        assert_eq!(g.spectrogram_rows, 4);
        assert_relative_eq!(g.frequency_resolution_mhz, 2.0);
    }

    #[test]
    fn test_geometry_rejects_degenerate() {
        assert!(SpectrogramGeometry::new(0.0, 64, 1.0).is_err());
        assert!(SpectrogramGeometry::new(16e6, 0, 1.0).is_err());
        assert!(SpectrogramGeometry::new(0.5e6, 64, 1.0).is_err());
    }

    #[test]
    fn test_tone_per_time_bin_recovered_exactly() {
        let mut handler = SpectrogramHandler::new(small_config()).unwrap();
        let g = *handler.geometry();
        let bins = [3usize, 7, 7, 12, 1, 30, 16, 5, 9, 9, 2, 25, 4, 18, 11, 6];
        assert_eq!(bins.len(), g.spectrogram_rows);

        let mut signal = Vec::with_capacity(g.capture_samples);
        for &bin in &bins {
            for n in 0..g.samples_per_window {
                let phase = 2.0 * PI * bin as f64 * n as f64 / g.fft_size as f64;
                signal.push(IQSample::from_polar(1.0, phase));
            }
        }
        handler.capture_mut().load_cyclic(&signal, false);
        handler.process_received_signal();

        let (times, freqs) = handler.detected_points();
        assert_eq!(times.len(), bins.len());
        for (row, &bin) in bins.iter().enumerate() {
            assert_eq!(times[row], 2.0 * row as f64 + 1.0);
            assert_eq!(freqs[row], 0.5 * bin as f64);
        }
    }

    #[test]
    fn test_peak_bins_follow_each_capture() {
        let mut handler = SpectrogramHandler::new(small_config()).unwrap();
        let g = *handler.geometry();

        for bin in [5usize, 21] {
            let signal: Vec<IQSample> = (0..g.capture_samples)
                .map(|n| {
                    let k = n % g.samples_per_window;
                    IQSample::from_polar(1.0, 2.0 * PI * bin as f64 * k as f64 / g.fft_size as f64)
                })
                .collect();
            handler.capture_mut().load_cyclic(&signal, false);
            handler.process_received_signal();

            assert_eq!(handler.peak_bins().len(), g.spectrogram_rows);
            assert!(handler.peak_bins().iter().all(|&b| b == bin));
            let (_, freqs) = handler.detected_points();
            assert!(freqs.iter().all(|&f| f == 0.5 * bin as f64));
        }
    }

    #[test]
    fn test_weak_rows_not_detected() {
        let mut handler = SpectrogramHandler::new(small_config()).unwrap();
        let g = *handler.geometry();

        let mut signal = Vec::with_capacity(g.capture_samples);
        for row in 0..g.spectrogram_rows {
            let amplitude = if row % 2 == 0 { 1.0 } else { 0.1 };
            for n in 0..g.samples_per_window {
                let phase = 2.0 * PI * 4.0 * n as f64 / g.fft_size as f64;
                signal.push(IQSample::from_polar(amplitude, phase));
            }
        }
        handler.capture_mut().load_cyclic(&signal, false);
        handler.process_received_signal();

        // Amplitude ratio of 10 is 10 dB below the strong rows
        let (times, _) = handler.detected_points();
        assert_eq!(times.len(), g.spectrogram_rows / 2);
        assert_eq!(times[1], 5.0);
    }

    #[test]
    fn test_silent_capture_yields_no_frame() {
        let mut handler = SpectrogramHandler::new(small_config()).unwrap();
        assert!(handler.process_received_signal().is_none());
        assert!(handler.frame_tracker().is_empty());
    }

    #[test]
    fn test_end_to_end_single_chirp() {
        let mut handler = SpectrogramHandler::new(wideband_config()).unwrap();
        let g = *handler.geometry();
        assert_eq!(g.spectrogram_rows, 4);
        assert_eq!(g.fft_size, 1024);

        // 20 MHz/µs chirp over rows 0..=2, silence in row 3
        let slope_mhz_per_us = 20.0;
        let signal = chirp(2.048e9, 201e6, slope_mhz_per_us * 1e12, 3 * 1024);
        handler.capture_mut().clear();
        handler.capture_mut().load_cyclic(&signal, false);
        handler.set_detection_start_time_us(500.0, 0.0);

        let record = handler.process_received_signal().unwrap();

        let chirps = handler.chirp_estimates();
        assert_eq!(chirps.len(), 1);
        assert_relative_eq!(chirps[0].slope_mhz_per_us, slope_mhz_per_us, max_relative = 0.01);
        assert_eq!(handler.cluster_ids(), &[1, 1, 1, 0]);

        assert_eq!(record.chirp_count, 1);
        assert_eq!(record.avg_chirp_period_us, 0.0);
        assert_relative_eq!(record.avg_slope_mhz_per_us, chirps[0].slope_mhz_per_us);
        // Zero crossing of 201 MHz + 20 MHz/µs·t is 10.05 µs before the capture
        assert_relative_eq!(record.start_time_us, 500.0 - 10.05, epsilon = 0.2);

        // Single-chirp frames never enter the running averages
        assert!(handler.frame_tracker().average_chirp_slope().is_none());
        assert!(handler.frame_tracker().average_chirp_period_us().is_none());
    }

    #[test]
    fn test_frame_prediction_across_captures() {
        let config = SpectrogramConfig {
            min_points_per_chirp: 4,
            ..small_config()
        };
        let mut handler = SpectrogramHandler::new(config).unwrap();
        let g = *handler.geometry();

        // Two identical 4-bin ramps per capture, then silence
        let bins = [2usize, 4, 6, 8, 2, 4, 6, 8, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut signal = Vec::with_capacity(g.capture_samples);
        for &bin in &bins {
            let amplitude = if bin == 0 { 0.0 } else { 1.0 };
            for n in 0..g.samples_per_window {
                let phase = 2.0 * PI * bin as f64 * n as f64 / g.fft_size as f64;
                signal.push(IQSample::from_polar(amplitude, phase));
            }
        }

        for (i, start) in [0.0, 1000.0, 2000.0].iter().enumerate() {
            handler.capture_mut().load_cyclic(&signal, false);
            handler.set_detection_start_time_us(*start, 0.0);
            let record = handler.process_received_signal().unwrap();
            assert_eq!(record.chirp_count, 2);
            if i == 0 {
                assert_eq!(record.predicted_next_start_us, 0.0);
            }
        }

        // Ramps rise 1 MHz per 2 µs and are 8 µs apart
        let avg_slope = handler.frame_tracker().average_chirp_slope().unwrap();
        assert_relative_eq!(avg_slope, 0.5, epsilon = 1e-9);
        assert_relative_eq!(
            handler.frame_tracker().average_chirp_period_us().unwrap(),
            8.0,
            epsilon = 1e-9
        );

        let last = handler.last_frame_start_time_us().unwrap();
        let predicted_ms = handler.next_frame_start_prediction_ms().unwrap();
        assert_relative_eq!(predicted_ms, (last + 1000.0) * 1e-3, epsilon = 1e-9);
    }

    #[test]
    fn test_propagation_delay_correction() {
        let mut handler = SpectrogramHandler::new(small_config()).unwrap();
        // 299.792458 m is exactly 1 µs of flight
        handler.set_detection_start_time_us(1000.0, 299.792458);
        assert_relative_eq!(handler.detection_start_time_us(), 999.0, epsilon = 1e-9);
    }

    #[test]
    fn test_save_state_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut handler = SpectrogramHandler::new(small_config()).unwrap();
        let g = *handler.geometry();
        handler.process_received_signal();
        handler.save_state(dir.path()).unwrap();

        let size = |name: &str| std::fs::metadata(dir.path().join(name)).unwrap().len() as usize;
        assert_eq!(size(HANN_WINDOW_FILE), g.fft_size * 8);
        assert_eq!(size(WINDOWED_FILE), g.spectrogram_rows * g.fft_size * 16);
        assert_eq!(size(SPECTROGRAM_FILE), g.spectrogram_rows * g.fft_size * 8);
        assert_eq!(size(CLUSTER_IDS_FILE), g.spectrogram_rows * 4);
        assert_eq!(size(CAPTURED_FRAMES_FILE), 4 * 6 * 8);

        let hann: Vec<f64> = crate::io::read_raw_file(dir.path().join(HANN_WINDOW_FILE)).unwrap();
        assert_eq!(hann, handler.hann());

        let path = handler.save_estimated_parameters(dir.path(), Some(2)).unwrap();
        assert!(path.ends_with("estimated_parameters_2.bin"));
    }

    #[test]
    fn test_reset_clears_frames() {
        let mut handler = SpectrogramHandler::new(wideband_config()).unwrap();
        let signal = chirp(2.048e9, 201e6, 20e12, 3 * 1024);
        handler.capture_mut().load_cyclic(&signal, false);
        handler.process_received_signal().unwrap();
        assert_eq!(handler.frame_tracker().len(), 1);

        handler.reset();
        assert!(handler.frame_tracker().is_empty());
        assert!(handler.last_frame_start_time_us().is_none());
        assert!(handler.capture().as_slice().iter().all(|s| s.norm() == 0.0));
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_fft_matches_sequential() {
        let signal = chirp(16e6, 1e6, 0.25e12, 512);

        let mut seq = SpectrogramHandler::new(small_config()).unwrap();
        seq.capture_mut().load_cyclic(&signal, false);
        seq.process_received_signal();

        let mut par = SpectrogramHandler::new(SpectrogramConfig {
            parallel_fft: true,
            ..small_config()
        })
        .unwrap();
        par.capture_mut().load_cyclic(&signal, false);
        par.process_received_signal();

        assert_eq!(seq.spectrogram().as_slice(), par.spectrogram().as_slice());
        assert_eq!(seq.detected_points(), par.detected_points());
    }
}
