//! Experiment Runner
//!
//! Wires a receiver, a transmitter and their shared clock into a sensing
//! subsystem and (when the attack is enabled) an attacking subsystem, then
//! runs both on their own real-time threads:
//!
//! ```text
//!  Experiment::run()
//!    ├─ spawn "attacking" ── AttackingSubsystem::run() ──┐
//!    ├─ spawn "sensing"   ── SensingSubsystem::run()   ──┤ (SyncBridge between them)
//!    ├─ join sensing, signal completion                  │
//!    └─ join attacking ◄─────────────────────────────────┘
//! ```
//!
//! Joins have no timeout: an attack frame that has been handed to the radio
//! always runs to completion, and the attacking thread exits once sensing has
//! signalled completion and the schedule is drained.

use std::sync::Arc;

use serde::Serialize;

use crate::attacking::{AttackReport, AttackingSubsystem};
use crate::config::ExperimentConfig;
use crate::hal::{DeviceClock, SampleReceiver, SampleTransmitter};
use crate::rt::{spawn_rt_thread, RtConfig};
use crate::sensing::{SensingReport, SensingSubsystem};
use crate::sync::SyncBridge;
use crate::types::{PipelineError, PipelineResult};

/// Outcome of one experiment run.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub run_number: Option<usize>,
    pub sensing: SensingReport,
    /// `None` when the attack is disabled
    pub attack: Option<AttackReport>,
}

/// A calibrated sensing/attacking pair, runnable one or more times.
pub struct Experiment {
    config: ExperimentConfig,
    bridge: Option<Arc<SyncBridge>>,
    // Moved into their threads for the duration of a run
    sensing: Option<SensingSubsystem>,
    attacking: Option<AttackingSubsystem>,
    noise_floor_db: f64,
}

impl Experiment {
    /// Build both subsystems and measure the noise floor.
    pub fn new(
        config: ExperimentConfig,
        receiver: Box<dyn SampleReceiver>,
        transmitter: Box<dyn SampleTransmitter>,
        clock: Arc<dyn DeviceClock>,
    ) -> PipelineResult<Self> {
        let bridge = config.attack.enabled.then(|| {
            Arc::new(SyncBridge::new(
                config.attack.num_attack_frames,
                config.radio.tx_rx_offset_us,
                Arc::clone(&clock),
            ))
        });

        let attacking = match &bridge {
            Some(bridge) => Some(AttackingSubsystem::new(
                &config,
                transmitter,
                Arc::clone(bridge),
            )?),
            None => None,
        };

        let mut sensing = SensingSubsystem::new(&config, receiver, clock, bridge.clone())?;
        let noise_floor_db = sensing.calibrate_noise_floor()?;

        tracing::info!(
            attack = config.attack.enabled,
            frames = config.sensing.max_frames_to_capture,
            "experiment ready"
        );

        Ok(Self {
            config,
            bridge,
            sensing: Some(sensing),
            attacking,
            noise_floor_db,
        })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn noise_floor_db(&self) -> f64 {
        self.noise_floor_db
    }

    pub fn sensing(&self) -> Option<&SensingSubsystem> {
        self.sensing.as_ref()
    }

    pub fn bridge(&self) -> Option<&Arc<SyncBridge>> {
        self.bridge.as_ref()
    }

    /// Run sensing and attacking concurrently until sensing completes.
    pub fn run(&mut self, run_number: Option<usize>) -> PipelineResult<ExperimentReport> {
        let mut sensing = self
            .sensing
            .take()
            .ok_or(PipelineError::ThreadPanicked("sensing"))?;

        let attack_handle = match self.attacking.take() {
            Some(mut attacking) => {
                let handle = spawn_rt_thread(RtConfig::attacking(&self.config.realtime), move || {
                    let report = attacking.run();
                    (attacking, report)
                });
                match handle {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        // The subsystem went down with the closure
                        self.sensing = Some(sensing);
                        return Err(e.into());
                    }
                }
            }
            None => None,
        };

        let sensing_result = spawn_rt_thread(RtConfig::sensing(&self.config.realtime), move || {
            let report = sensing.run(run_number);
            (sensing, report)
        })
        .map_err(PipelineError::from)
        .and_then(|handle| {
            handle
                .join()
                .map_err(|_| PipelineError::ThreadPanicked("sensing"))
        });

        // Releases the attacking thread even if sensing never got to
        if let Some(bridge) = &self.bridge {
            bridge.signal_sensing_complete();
        }

        let attack = match attack_handle {
            Some(handle) => {
                let (attacking, report) = handle
                    .join()
                    .map_err(|_| PipelineError::ThreadPanicked("attacking"))?;
                self.attacking = Some(attacking);
                Some(report)
            }
            None => None,
        };

        let (sensing, sensing_report) = sensing_result?;
        self.sensing = Some(sensing);

        Ok(ExperimentReport {
            run_number,
            sensing: sensing_report,
            attack,
        })
    }

    /// Run `runs` experiments back to back, resetting between them. Runs
    /// are numbered from 0 when more than one is requested.
    pub fn run_repeated(&mut self, runs: usize) -> PipelineResult<Vec<ExperimentReport>> {
        let mut reports = Vec::with_capacity(runs);
        for run in 0..runs {
            if run > 0 {
                self.reset();
            }
            let run_number = (runs > 1).then_some(run);
            reports.push(self.run(run_number)?);
        }
        Ok(reports)
    }

    /// Clear frames, the schedule and the attack state. The noise floor is kept.
    pub fn reset(&mut self) {
        if let Some(sensing) = &mut self.sensing {
            sensing.reset();
        }
        if let Some(bridge) = &self.bridge {
            bridge.reset();
        }
        if let Some(attacking) = &mut self.attacking {
            attacking.reset();
        }
    }
}
