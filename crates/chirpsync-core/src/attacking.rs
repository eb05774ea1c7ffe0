//! Attacking Subsystem
//!
//! Consumes predicted victim frame starts from the [`SyncBridge`] and
//! transmits one attack frame at each of them.
//!
//! ```text
//!         first publish          transmit_schedule() returns
//!  Idle ──► Waiting ───────► Transmitting ──────────────┐
//!              ▲                                        │
//!              └────────────────────────────────────────┘
//!              │ sensing complete, nothing pending
//!              ▼
//!            Done
//! ```
//!
//! A transmission is never cancelled once handed to the radio; the loop
//! only exits between bursts.

use std::sync::Arc;

use serde::Serialize;

use crate::buffer::{BufferError, BufferShape, SampleBuffer};
use crate::config::{ChirpTemplate, ExperimentConfig};
use crate::hal::SampleTransmitter;
use crate::sync::SyncBridge;
use crate::types::{IQSample, PipelineResult};

/// Where the attacking loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AttackState {
    #[default]
    Idle,
    /// Blocked on the schedule
    Waiting,
    /// Inside a transmit call
    Transmitting,
    Done,
}

/// Summary of one [`AttackingSubsystem::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AttackReport {
    /// Attack frames handed to the radio
    pub frames_transmitted: usize,
    /// Frames whose start time had already passed at the radio
    pub late_frames: usize,
    /// Transmit calls that returned an error
    pub failed_frames: usize,
    pub samples_sent: usize,
    /// Scheduled start of every attempted frame (s, device time)
    pub transmit_times_s: Vec<f64>,
}

/// One period (sweep plus idle) of the attack chirp at `sample_rate`.
///
/// Phase is `2π(f0·t + ½·k·t²)` over the sweep; the idle part is silent.
pub fn synthesize_chirp(template: &ChirpTemplate, sample_rate: f64) -> Vec<IQSample> {
    let sweep_samples = (template.duration_us * 1e-6 * sample_rate).round() as usize;
    let idle_samples = (template.idle_us * 1e-6 * sample_rate).round() as usize;

    let f0_hz = template.start_frequency_mhz * 1e6;
    let k_hz_per_s = template.slope_mhz_per_us * 1e12;

    let mut chirp = Vec::with_capacity(sweep_samples + idle_samples);
    for n in 0..sweep_samples {
        let t = n as f64 / sample_rate;
        let phase = 2.0 * std::f64::consts::PI * (f0_hz * t + 0.5 * k_hz_per_s * t * t);
        chirp.push(IQSample::from_polar(template.amplitude, phase));
    }
    chirp.resize(sweep_samples + idle_samples, IQSample::new(0.0, 0.0));
    chirp
}

/// Build the attack frame buffer from a waveform file, or by replicating a
/// synthesized chirp `num_chirps` times.
pub fn load_attack_signal(config: &ExperimentConfig) -> Result<SampleBuffer<IQSample>, BufferError> {
    let spb = config.radio.tx_samples_per_buffer;
    let attack = &config.attack;

    let (shape, source) = match &attack.signal_file {
        Some(path) => {
            let samples = attack.signal_format.read_file(path)?;
            tracing::info!(
                path = %path.display(),
                samples = samples.len(),
                "attack waveform loaded"
            );
            (BufferShape::for_samples(spb, samples.len()), samples)
        }
        None => {
            let chirp = synthesize_chirp(&attack.chirp, config.radio.sample_rate);
            (
                BufferShape::for_chirps(spb, chirp.len(), attack.chirp.num_chirps),
                chirp,
            )
        }
    };

    if source.is_empty() || shape.rows == 0 {
        return Err(BufferError::Empty);
    }

    let mut buffer = SampleBuffer::with_shape(shape)?;
    buffer.load_cyclic(&source, true);
    Ok(buffer)
}

/// Transmits attack frames at the times published by the sensing thread.
pub struct AttackingSubsystem {
    transmitter: Box<dyn SampleTransmitter>,
    bridge: Arc<SyncBridge>,
    signal: SampleBuffer<IQSample>,
    frame_periodicity_s: f64,
    state: AttackState,
}

impl AttackingSubsystem {
    pub fn new(
        config: &ExperimentConfig,
        transmitter: Box<dyn SampleTransmitter>,
        bridge: Arc<SyncBridge>,
    ) -> PipelineResult<Self> {
        let signal = load_attack_signal(config)?;
        tracing::debug!(
            rows = signal.rows(),
            cols = signal.cols(),
            excess = signal.excess(),
            "attack buffer ready"
        );

        Ok(Self {
            transmitter,
            bridge,
            signal,
            frame_periodicity_s: config.attack.estimated_frame_periodicity_ms * 1e-3,
            state: AttackState::Idle,
        })
    }

    pub fn state(&self) -> AttackState {
        self.state
    }

    pub fn signal(&self) -> &SampleBuffer<IQSample> {
        &self.signal
    }

    /// Transmit until the schedule is exhausted or sensing completes.
    pub fn run(&mut self) -> AttackReport {
        let mut report = AttackReport::default();
        self.state = AttackState::Waiting;
        tracing::debug!("attacking thread waiting for predictions");

        while let Some(start_s) = self.bridge.consume_next() {
            self.state = AttackState::Transmitting;

            if let Some(&previous) = report.transmit_times_s.last() {
                if self.frame_periodicity_s > 0.0 {
                    let frames = ((start_s - previous) / self.frame_periodicity_s).round();
                    if frames > 1.0 {
                        tracing::debug!(skipped = frames - 1.0, "victim frames without an attack");
                    }
                }
            }
            report.transmit_times_s.push(start_s);

            match self
                .transmitter
                .transmit_schedule(&[start_s], self.signal.view())
            {
                Ok(tx) => {
                    report.frames_transmitted += tx.bursts_sent;
                    report.late_frames += tx.late_bursts;
                    report.samples_sent += tx.samples_sent;
                    if tx.late_bursts > 0 {
                        tracing::warn!(start_s, "attack frame transmitted late");
                    }
                }
                Err(e) => {
                    report.failed_frames += 1;
                    tracing::warn!(start_s, "attack transmission failed: {}", e);
                }
            }

            self.state = AttackState::Waiting;
        }

        self.state = AttackState::Done;
        tracing::info!(
            frames = report.frames_transmitted,
            late = report.late_frames,
            failed = report.failed_frames,
            "attack complete"
        );
        report
    }

    /// Return to `Idle` for another run. The schedule is reset by its owner.
    pub fn reset(&mut self) {
        self.state = AttackState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferView;
    use crate::hal::{DeviceClock, RadioError, RadioResult, TxReport};
    use crate::io::IqFormat;
    use approx::assert_relative_eq;
    use std::sync::Mutex;

    struct FrozenClock(f64);

    impl DeviceClock for FrozenClock {
        fn now_s(&self) -> f64 {
            self.0
        }
    }

    #[derive(Default)]
    struct Recorded {
        times: Vec<f64>,
        burst_len: usize,
    }

    struct RecordingTransmitter {
        log: Arc<Mutex<Recorded>>,
        fail_at: Option<f64>,
    }

    impl SampleTransmitter for RecordingTransmitter {
        fn transmit_schedule(
            &mut self,
            times_s: &[f64],
            burst: BufferView<'_, IQSample>,
        ) -> RadioResult<TxReport> {
            if self.fail_at == times_s.first().copied() {
                return Err(RadioError::InvalidTime(times_s[0]));
            }
            let mut log = self.log.lock().unwrap();
            log.times.extend_from_slice(times_s);
            log.burst_len = burst.valid_samples().len();
            Ok(TxReport {
                bursts_sent: times_s.len(),
                samples_sent: times_s.len() * burst.valid_samples().len(),
                late_bursts: 0,
            })
        }
    }

    fn test_config() -> ExperimentConfig {
        ExperimentConfig::parse(ExperimentConfig::example_yaml()).unwrap()
    }

    fn subsystem(
        config: &ExperimentConfig,
        fail_at: Option<f64>,
    ) -> (AttackingSubsystem, Arc<SyncBridge>, Arc<Mutex<Recorded>>) {
        let bridge = Arc::new(SyncBridge::new(8, 0.0, Arc::new(FrozenClock(0.0))));
        let log = Arc::new(Mutex::new(Recorded::default()));
        let tx = RecordingTransmitter {
            log: Arc::clone(&log),
            fail_at,
        };
        let attacking = AttackingSubsystem::new(config, Box::new(tx), Arc::clone(&bridge)).unwrap();
        (attacking, bridge, log)
    }

    #[test]
    fn test_synthesized_chirp_period() {
        let template = ChirpTemplate::default();
        let chirp = synthesize_chirp(&template, 25e6);

        // 36 µs sweep + 4 µs idle at 25 MSps
        assert_eq!(chirp.len(), 1000);
        assert_relative_eq!(chirp[0].re, 1.0);
        assert!(chirp[..900].iter().all(|s| (s.norm() - 1.0).abs() < 1e-12));
        assert!(chirp[900..].iter().all(|s| s.norm() == 0.0));
    }

    #[test]
    fn test_synthesized_frame_replicates_chirp() {
        let config = test_config();
        let signal = load_attack_signal(&config).unwrap();

        // 8 chirps of 1000 samples in rows of 2000
        assert_eq!(signal.shape(), BufferShape::new(4, 2000, 0).unwrap());
        let chirp = synthesize_chirp(&config.attack.chirp, config.radio.sample_rate);
        for k in 0..8 {
            assert_eq!(&signal.as_slice()[k * 1000..(k + 1) * 1000], chirp.as_slice());
        }
    }

    #[test]
    fn test_waveform_file_with_excess() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attack.cf32");
        let samples: Vec<IQSample> = (0..4500).map(|i| IQSample::new(i as f64 * 1e-4, 0.5)).collect();
        IqFormat::Cf32.write_file(&path, &samples).unwrap();

        let mut config = test_config();
        config.attack.signal_file = Some(path);
        let signal = load_attack_signal(&config).unwrap();

        assert_eq!(signal.rows(), 3);
        assert_eq!(signal.excess(), 1500);
        assert_eq!(signal.valid_samples().len(), 4500);
        assert_relative_eq!(signal.valid_samples()[4499].re, 0.4499, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_waveform_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.cf32");
        std::fs::write(&path, b"").unwrap();

        let mut config = test_config();
        config.attack.signal_file = Some(path);
        assert!(matches!(load_attack_signal(&config), Err(BufferError::Empty)));
    }

    #[test]
    fn test_missing_waveform_file_is_an_error() {
        let mut config = test_config();
        config.attack.signal_file = Some("/nonexistent/attack.cf32".into());
        assert!(load_attack_signal(&config).is_err());
    }

    #[test]
    fn test_run_transmits_in_schedule_order() {
        let config = test_config();
        let (mut attacking, bridge, log) = subsystem(&config, None);
        assert_eq!(attacking.state(), AttackState::Idle);

        for ms in [10.0, 20.0, 40.0] {
            bridge.publish(ms);
        }
        bridge.signal_sensing_complete();

        let report = attacking.run();
        assert_eq!(attacking.state(), AttackState::Done);
        assert_eq!(report.frames_transmitted, 3);
        assert_eq!(report.samples_sent, 3 * 8000);

        let log = log.lock().unwrap();
        assert_eq!(log.times, vec![0.01, 0.02, 0.04]);
        assert_eq!(log.burst_len, 8000);
    }

    #[test]
    fn test_failed_transmission_does_not_stop_the_loop() {
        let config = test_config();
        let (mut attacking, bridge, log) = subsystem(&config, Some(0.02));
        for ms in [10.0, 20.0, 30.0] {
            bridge.publish(ms);
        }
        bridge.signal_sensing_complete();

        let report = attacking.run();
        assert_eq!(report.failed_frames, 1);
        assert_eq!(report.frames_transmitted, 2);
        assert_eq!(report.transmit_times_s.len(), 3);
        assert_eq!(log.lock().unwrap().times, vec![0.01, 0.03]);

        attacking.reset();
        assert_eq!(attacking.state(), AttackState::Idle);
    }
}
