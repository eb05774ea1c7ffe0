//! Sensing Subsystem
//!
//! Drives one sensing cycle per victim frame:
//!
//! ```text
//!  ┌──────────────┐ row by row ┌────────────────┐ trigger ┌────────────────────┐
//!  │ SampleReceiver├──────────►│ EnergyDetector ├────────►│ SpectrogramHandler │
//!  └──────────────┘            └────────────────┘         └─────────┬──────────┘
//!         ▲ listen at last frame start + min periodicity             │ prediction
//!         └──────────────────────────────────────────────────────────┤
//!                                                                    ▼
//!                                                             SyncBridge (attack)
//! ```
//!
//! An overflow or timeout while listening restarts the detection window and
//! listening goes on until the waiting time runs out. One that hits the
//! capture after the trigger drops the frame. Neither stops the run.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use crate::buffer::SampleBuffer;
use crate::config::ExperimentConfig;
use crate::energy_detector::EnergyDetector;
use crate::frame_tracker::FrameSummary;
use crate::hal::{DeviceClock, RxReport, SampleReceiver, StreamStart};
use crate::spectrogram::SpectrogramHandler;
use crate::sync::{PublishOutcome, SyncBridge};
use crate::types::{IQSample, PipelineError, PipelineResult};

/// Rows read and discarded when the stream is flushed between runs
const FLUSH_ROWS: usize = 10;

/// Result of one [`SensingSubsystem::capture_next_frame`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// A chirp triggered and the spectrogram capture is full
    Captured,
    /// Nothing crossed the energy threshold before the waiting budget ran out
    NoChirp,
    /// Samples were lost (overflow or timeout) after the trigger; the frame
    /// was discarded
    Dropped,
}

/// Counters and estimates from one [`SensingSubsystem::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensingReport {
    pub run_number: Option<usize>,
    pub cycles: usize,
    /// Cycles that added a frame record
    pub frames_captured: usize,
    /// Captures in which no valid chirp could be fitted
    pub frames_rejected: usize,
    pub no_chirp: usize,
    pub dropped: usize,
    /// Predictions accepted by the attack schedule
    pub predictions_published: usize,
    /// Predictions refused (stale, schedule full, after completion)
    pub predictions_discarded: usize,
    pub estimates: FrameSummary,
    /// Per-run frame table, when an output directory is configured
    pub results_file: Option<PathBuf>,
}

/// Energy detection, spectrogram estimation and prediction publishing.
pub struct SensingSubsystem {
    config: ExperimentConfig,
    detector: EnergyDetector,
    spectrogram: SpectrogramHandler,
    receiver: Box<dyn SampleReceiver>,
    clock: Arc<dyn DeviceClock>,
    bridge: Option<Arc<SyncBridge>>,
    overflow_reported: bool,
}

impl SensingSubsystem {
    pub fn new(
        config: &ExperimentConfig,
        receiver: Box<dyn SampleReceiver>,
        clock: Arc<dyn DeviceClock>,
        bridge: Option<Arc<SyncBridge>>,
    ) -> PipelineResult<Self> {
        let spectrogram = SpectrogramHandler::from_config(config)?;

        if config.attack.enabled && bridge.is_none() {
            tracing::warn!("attack enabled but no schedule attached, predictions will not be published");
        }

        Ok(Self {
            config: config.clone(),
            detector: EnergyDetector::from_config(config),
            spectrogram,
            receiver,
            clock,
            bridge,
            overflow_reported: false,
        })
    }

    pub fn detector(&self) -> &EnergyDetector {
        &self.detector
    }

    pub fn spectrogram(&self) -> &SpectrogramHandler {
        &self.spectrogram
    }

    /// Measure the noise floor over `noise_calibration_ms` of received samples.
    pub fn calibrate_noise_floor(&mut self) -> PipelineResult<f64> {
        let spb = self.config.radio.rx_samples_per_buffer;
        let samples = self.config.sensing.noise_calibration_ms * 1e-3 * self.config.radio.sample_rate;
        let rows = ((samples / spb as f64).ceil() as usize).max(1);

        let mut buffer: SampleBuffer<IQSample> = SampleBuffer::new(rows, spb);
        let report = self.receiver.receive(buffer.view_mut(), StreamStart::Now);
        self.receiver.stop();

        if !report.is_complete(buffer.valid_len()) {
            return Err(PipelineError::Calibration(format!(
                "received {} of {} samples (overflow: {}, timeout: {})",
                report.samples_received,
                buffer.valid_len(),
                report.overflow,
                report.timeout
            )));
        }

        let noise_db = self
            .detector
            .calibrate(buffer.valid_samples())
            .ok_or_else(|| PipelineError::Calibration("empty calibration capture".to_string()))?;
        if !noise_db.is_finite() {
            return Err(PipelineError::Calibration(format!(
                "noise floor is {} dB, the calibration capture is silent",
                noise_db
            )));
        }
        tracing::info!(noise_db, rows, "noise floor measured");
        Ok(noise_db)
    }

    fn report_rx_fault(&mut self, report: &RxReport, action: &'static str) {
        if report.overflow {
            if self.overflow_reported {
                tracing::debug!(action, "receive overflow");
            } else {
                self.overflow_reported = true;
                tracing::warn!(action, "receive overflow");
            }
        } else if report.timeout {
            tracing::warn!(received = report.samples_received, action, "receive timeout");
        } else {
            tracing::warn!(received = report.samples_received, action, "short receive");
        }
    }

    /// Listen from `start_s` (device time) until a chirp triggers, then fill
    /// the spectrogram capture.
    pub fn capture_next_frame(&mut self, start_s: f64) -> CaptureOutcome {
        let outcome = self.listen_and_capture(start_s);
        self.receiver.stop();
        outcome
    }

    fn listen_and_capture(&mut self, start_s: f64) -> CaptureOutcome {
        let spb = self.config.radio.rx_samples_per_buffer;
        let deadline_s = start_s + self.config.sensing.max_waiting_time_ms * 1e-3;

        let mut start = if start_s > self.clock.now_s() {
            StreamStart::At(start_s)
        } else {
            tracing::debug!(start_s, "listen start already passed, streaming now");
            StreamStart::Now
        };

        loop {
            let index = self.detector.window().current_index();
            let report = self
                .receiver
                .receive(self.detector.window_mut().current_view_mut(), start);
            start = StreamStart::Continue;

            if report.is_complete(spb) {
                self.detector
                    .window_mut()
                    .set_current_timestamp_us(report.first_sample_time_s * 1e6);

                if self.detector.check_for_chirp(index) {
                    break;
                }
            } else {
                // History is no longer contiguous; scan on from a fresh stream
                self.report_rx_fault(&report, "listening restarted");
                self.detector.reset();
                self.receiver.stop();
                start = StreamStart::Now;
            }

            if self.clock.now_s() > deadline_s {
                tracing::debug!(start_s, "no chirp within the waiting time");
                return CaptureOutcome::NoChirp;
            }
        }

        let capture_start_us = self.detector.detection_start_time_us();
        let capture = self.spectrogram.capture_mut();
        let rows = capture.rows();

        let copied = {
            let mut view = capture.view_mut();
            self.detector.save_capture_to(&mut view)
        };

        if copied < rows {
            let rest = match capture.rows_view_mut(copied, rows - copied) {
                Ok(view) => view,
                Err(e) => {
                    tracing::warn!("{}", e);
                    return CaptureOutcome::Dropped;
                }
            };
            let requested = rest.len();
            let report = self.receiver.receive(rest, StreamStart::Continue);
            if !report.is_complete(requested) {
                self.report_rx_fault(&report, "frame dropped");
                return CaptureOutcome::Dropped;
            }
        }

        self.spectrogram
            .set_detection_start_time_us(capture_start_us, self.config.sensing.victim_distance_m);
        tracing::debug!(capture_start_us, history_rows = copied.saturating_sub(1), "chirp captured");
        CaptureOutcome::Captured
    }

    fn publish_prediction(&self, report: &mut SensingReport) {
        let bridge = match &self.bridge {
            Some(bridge) => bridge,
            None => return,
        };
        let predicted_ms = match self.spectrogram.next_frame_start_prediction_ms() {
            Some(ms) => ms,
            None => {
                tracing::debug!("not enough frames for a prediction yet");
                return;
            }
        };

        match bridge.publish(predicted_ms) {
            PublishOutcome::Scheduled { .. } => report.predictions_published += 1,
            _ => report.predictions_discarded += 1,
        }
    }

    /// Run `max_frames_to_capture` sensing cycles.
    ///
    /// `run_number` names the per-run results file when experiments are
    /// repeated.
    pub fn run(&mut self, run_number: Option<usize>) -> SensingReport {
        let sensing = &self.config.sensing;
        let max_frames = sensing.max_frames_to_capture;
        let min_periodicity_s = self.config.min_frame_periodicity_s();
        let attack_enabled = self.config.attack.enabled;
        let attack_start_frame = self.config.attack.start_frame;

        tracing::info!(run = ?run_number, max_frames, "sensing started");

        let mut report = SensingReport {
            run_number,
            ..SensingReport::default()
        };
        let mut next_start_s = self.clock.now_s() + min_periodicity_s;

        for i in 0..max_frames {
            report.cycles += 1;
            let mut new_frame = false;

            match self.capture_next_frame(next_start_s) {
                CaptureOutcome::Captured => {
                    if self.spectrogram.process_received_signal().is_some() {
                        report.frames_captured += 1;
                        new_frame = true;
                    } else {
                        report.frames_rejected += 1;
                    }
                }
                CaptureOutcome::NoChirp => report.no_chirp += 1,
                CaptureOutcome::Dropped => report.dropped += 1,
            }
            self.detector.reset();

            next_start_s = match self.spectrogram.last_frame_start_time_us() {
                Some(us) => us * 1e-6 + min_periodicity_s,
                None => self.clock.now_s() + min_periodicity_s,
            };

            // A cycle without a new frame would only repeat the last prediction
            if new_frame && attack_enabled && i > attack_start_frame {
                self.publish_prediction(&mut report);
            }
        }

        if let Some(bridge) = &self.bridge {
            bridge.signal_sensing_complete();
        }

        let output_dir = self.config.sensing.output_dir.clone();
        if self.config.sensing.debug {
            if let Some(dir) = &output_dir {
                if let Err(e) = self.spectrogram.save_state(dir) {
                    tracing::warn!(dir = %dir.display(), "failed to save sensing state: {}", e);
                }
            }
            self.spectrogram.log_summary();
        }

        if let Some(dir) = &output_dir {
            match self.spectrogram.save_estimated_parameters(dir, run_number) {
                Ok(path) => report.results_file = Some(path),
                Err(e) => tracing::warn!(dir = %dir.display(), "failed to save estimates: {}", e),
            }
        }

        report.estimates = self.spectrogram.frame_tracker().summary();
        tracing::info!(
            run = ?run_number,
            frames = report.frames_captured,
            no_chirp = report.no_chirp,
            dropped = report.dropped,
            published = report.predictions_published,
            "sensing complete"
        );
        report
    }

    /// Prepare for another run: forget all frames and flush stale samples
    /// from the receive stream. The noise floor is kept.
    pub fn reset(&mut self) {
        self.spectrogram.reset();
        self.detector.reset();
        self.overflow_reported = false;

        let mut flush: SampleBuffer<IQSample> =
            SampleBuffer::new(FLUSH_ROWS, self.config.radio.rx_samples_per_buffer);
        let report = self.receiver.receive(flush.view_mut(), StreamStart::Now);
        self.receiver.stop();
        tracing::debug!(flushed = report.samples_received, "receive stream flushed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferViewMut;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestClock(AtomicU64);

    impl TestClock {
        fn at(t: f64) -> Arc<Self> {
            Arc::new(Self(AtomicU64::new(t.to_bits())))
        }

        fn advance_to(&self, t: f64) {
            if t > self.now_s() {
                self.0.store(t.to_bits(), Ordering::SeqCst);
            }
        }
    }

    impl DeviceClock for TestClock {
        fn now_s(&self) -> f64 {
            f64::from_bits(self.0.load(Ordering::SeqCst))
        }
    }

    /// Weak tone everywhere, full-scale tone from `onset_s` on.
    struct StepReceiver {
        clock: Arc<TestClock>,
        sample_rate: f64,
        onset_s: f64,
        stream_start_s: f64,
        position: usize,
        overflow_on_call: Option<usize>,
        silent: bool,
        calls: usize,
    }

    impl StepReceiver {
        fn new(clock: Arc<TestClock>, onset_s: f64) -> Self {
            Self {
                clock,
                sample_rate: 25e6,
                onset_s,
                stream_start_s: 0.0,
                position: 0,
                overflow_on_call: None,
                silent: false,
                calls: 0,
            }
        }
    }

    impl SampleReceiver for StepReceiver {
        fn receive(&mut self, mut dest: BufferViewMut<'_, IQSample>, start: StreamStart) -> RxReport {
            self.calls += 1;
            match start {
                StreamStart::Now => {
                    self.stream_start_s = self.clock.now_s();
                    self.position = 0;
                }
                StreamStart::At(t) => {
                    self.stream_start_s = t;
                    self.position = 0;
                }
                StreamStart::Continue => {}
            }

            let first = self.stream_start_s + self.position as f64 / self.sample_rate;
            let n = dest.len();
            for sample in dest.as_mut_slice() {
                let t = self.stream_start_s + self.position as f64 / self.sample_rate;
                let amplitude = if self.silent {
                    0.0
                } else if t >= self.onset_s {
                    1.0
                } else {
                    1e-3
                };
                *sample = IQSample::from_polar(amplitude, 0.7 * self.position as f64);
                self.position += 1;
            }
            self.clock
                .advance_to(self.stream_start_s + self.position as f64 / self.sample_rate);

            RxReport {
                samples_received: n,
                first_sample_time_s: first,
                overflow: self.overflow_on_call == Some(self.calls),
                timeout: false,
            }
        }
    }

    fn test_config() -> ExperimentConfig {
        let mut config = ExperimentConfig::parse(ExperimentConfig::example_yaml()).unwrap();
        config.sensing.max_waiting_time_ms = 1.0;
        config.attack.enabled = false;
        config
    }

    fn subsystem(receiver: StepReceiver, clock: Arc<TestClock>) -> SensingSubsystem {
        SensingSubsystem::new(&test_config(), Box::new(receiver), clock, None).unwrap()
    }

    #[test]
    fn test_calibration_measures_quiet_floor() {
        let clock = TestClock::at(1.0);
        let mut sensing = subsystem(StepReceiver::new(clock.clone(), 5.0), clock.clone());

        let noise_db = sensing.calibrate_noise_floor().unwrap();
        // |x|² = 1e-6 per sample at 25 MSps
        assert_relative_eq!(noise_db, 10.0 * (1e-6 * 25e6f64).log10(), epsilon = 1e-9);
        assert!(clock.now_s() >= 1.001);
    }

    #[test]
    fn test_capture_keeps_row_before_trigger() {
        let clock = TestClock::at(1.0);
        let mut sensing = subsystem(StepReceiver::new(clock.clone(), 1.0025), clock.clone());
        sensing.calibrate_noise_floor().unwrap();

        // 80 µs rows from 1.002 s: the onset falls 20 µs into row 6
        let outcome = sensing.capture_next_frame(1.002);
        assert_eq!(outcome, CaptureOutcome::Captured);
        assert_relative_eq!(
            sensing.spectrogram().detection_start_time_us(),
            1_002_400.0,
            epsilon = 1e-3
        );

        let capture = sensing.spectrogram().capture();
        assert!(capture.row(0).iter().all(|s| s.norm() < 0.01));
        assert!(capture.row(2).iter().all(|s| (s.norm() - 1.0).abs() < 1e-9));
        assert!(capture.row(3).iter().all(|s| (s.norm() - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_no_chirp_gives_up_after_waiting_time() {
        let clock = TestClock::at(1.0);
        let mut sensing = subsystem(StepReceiver::new(clock.clone(), 100.0), clock.clone());
        sensing.calibrate_noise_floor().unwrap();

        assert_eq!(sensing.capture_next_frame(1.01), CaptureOutcome::NoChirp);
        assert!(clock.now_s() > 1.011);
    }

    #[test]
    fn test_overflow_while_listening_keeps_scanning() {
        let clock = TestClock::at(1.0);
        let mut receiver = StepReceiver::new(clock.clone(), 1.0025);
        // Call 1 is the calibration, call 3 is the second listening row
        receiver.overflow_on_call = Some(3);
        let mut sensing = subsystem(receiver, clock.clone());
        sensing.calibrate_noise_floor().unwrap();

        assert_eq!(sensing.capture_next_frame(1.002), CaptureOutcome::Captured);
        assert_relative_eq!(
            sensing.spectrogram().detection_start_time_us(),
            1_002_400.0,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_overflow_after_trigger_drops_frame() {
        let clock = TestClock::at(1.0);
        let mut receiver = StepReceiver::new(clock.clone(), 1.0025);
        // Row 6 (call 8) triggers, call 9 reads the rest of the capture
        receiver.overflow_on_call = Some(9);
        let mut sensing = subsystem(receiver, clock.clone());
        sensing.calibrate_noise_floor().unwrap();

        assert_eq!(sensing.capture_next_frame(1.002), CaptureOutcome::Dropped);
    }

    #[test]
    fn test_silent_calibration_is_rejected() {
        let clock = TestClock::at(1.0);
        let mut receiver = StepReceiver::new(clock.clone(), 100.0);
        receiver.silent = true;
        let mut sensing = subsystem(receiver, clock.clone());

        assert!(matches!(
            sensing.calibrate_noise_floor(),
            Err(PipelineError::Calibration(_))
        ));
    }

    #[test]
    fn test_run_counts_cycles_without_victim() {
        let clock = TestClock::at(1.0);
        let mut config = test_config();
        config.sensing.max_frames_to_capture = 3;
        let mut sensing = SensingSubsystem::new(
            &config,
            Box::new(StepReceiver::new(clock.clone(), 100.0)),
            clock.clone(),
            None,
        )
        .unwrap();
        sensing.calibrate_noise_floor().unwrap();

        let report = sensing.run(Some(1));
        assert_eq!(report.cycles, 3);
        assert_eq!(report.no_chirp, 3);
        assert_eq!(report.frames_captured, 0);
        assert_eq!(report.estimates.frames_captured, 0);
        assert!(report.results_file.is_none());
    }
}
