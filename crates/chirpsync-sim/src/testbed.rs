//! Simulated Testbed
//!
//! Builds a victim, a noisy receiver and a logging transmitter around one
//! shared clock, ready to hand to `chirpsync_core::Experiment`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use chirpsync_core::hal::{DeviceClock, SampleReceiver, SampleTransmitter};

use crate::noise::AwgnSource;
use crate::radio::{ClockMode, SimClock, SimReceiver, SimTransmitter, TransmitLog};
use crate::victim::{VictimConfig, VictimRadar};
use crate::{SimError, SimResult};

/// Simulation settings, loadable from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub victim: VictimConfig,
    /// Receiver noise power (dB relative to a unit sample); `None` is noiseless
    pub noise_power_db: Option<f64>,
    /// Noise seed; `None` seeds from entropy
    pub seed: Option<u64>,
    /// Wall-clock pacing factor; `None` runs on virtual time
    pub speed: Option<f64>,
    /// Report an overflow on every Nth receive call
    pub overflow_every: Option<usize>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            victim: VictimConfig::default(),
            noise_power_db: Some(-40.0),
            seed: Some(1),
            speed: None,
            overflow_every: None,
        }
    }
}

impl SimConfig {
    pub fn clock_mode(&self) -> ClockMode {
        match self.speed {
            Some(speed) => ClockMode::Paced { speed },
            None => ClockMode::Virtual,
        }
    }
}

/// A simulated victim and radio pair sharing one device clock.
pub struct SimTestbed {
    clock: Arc<SimClock>,
    victim: VictimRadar,
    receiver: SimReceiver,
    transmitter: SimTransmitter,
}

impl SimTestbed {
    pub fn new(config: &SimConfig, sample_rate: f64) -> SimResult<Self> {
        if !sample_rate.is_finite() || sample_rate <= 0.0 {
            return Err(SimError::InvalidClock(format!("sample rate {}", sample_rate)));
        }

        let clock = Arc::new(SimClock::new(config.clock_mode())?);
        let victim = VictimRadar::new(config.victim.clone())?;
        let noise = config
            .noise_power_db
            .map(|db| AwgnSource::new(db, config.seed))
            .transpose()?;

        let mut receiver = SimReceiver::new(victim.clone(), noise, Arc::clone(&clock), sample_rate);
        if let Some(n) = config.overflow_every {
            receiver = receiver.with_overflow_every(n);
        }
        let transmitter = SimTransmitter::new(Arc::clone(&clock), sample_rate);

        tracing::info!(
            slope_mhz_per_us = config.victim.slope_mhz_per_us,
            frame_period_ms = config.victim.frame_period_ms,
            mode = ?config.clock_mode(),
            "simulated testbed ready"
        );

        Ok(Self {
            clock,
            victim,
            receiver,
            transmitter,
        })
    }

    pub fn clock(&self) -> &Arc<SimClock> {
        &self.clock
    }

    pub fn victim(&self) -> &VictimRadar {
        &self.victim
    }

    /// Handle on the transmitter's burst log, valid after `into_radios`.
    pub fn transmit_log(&self) -> TransmitLog {
        self.transmitter.log()
    }

    /// Split into the trait objects an experiment is built from.
    pub fn into_radios(
        self,
    ) -> (
        Box<dyn SampleReceiver>,
        Box<dyn SampleTransmitter>,
        Arc<dyn DeviceClock>,
    ) {
        let receiver: Box<dyn SampleReceiver> = Box::new(self.receiver);
        let transmitter: Box<dyn SampleTransmitter> = Box::new(self.transmitter);
        let clock: Arc<dyn DeviceClock> = self.clock;
        (receiver, transmitter, clock)
    }
}
