//! Victim FMCW Radar
//!
//! Emits frames of identical linear up-chirps:
//!
//! ```text
//!  freq
//!   ▲     /|    /|    /|              /|    /|
//!   │    / |   / |   / |   ...       / |   / |
//!   │   /  |__/  |__/  |__          /  |__/  |__
//!   └──┴─────────────────────────┴──────────────────► t
//!      │◄─ num_chirps · period ─►│
//!      │◄──────── frame_period ────────►│
//! ```
//!
//! The signal seen at the receiver is delayed by the one-way propagation
//! time `distance_m / c`.

use serde::{Deserialize, Serialize};

use chirpsync_core::types::IQSample;

use crate::{SimError, SimResult};

/// Speed of light (m/s)
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Waveform and timing of the simulated victim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VictimConfig {
    /// Frequency at the start of each chirp (MHz, baseband)
    pub start_frequency_mhz: f64,
    /// Chirp slope (MHz/µs)
    pub slope_mhz_per_us: f64,
    /// Sweep duration (µs)
    pub chirp_duration_us: f64,
    /// Silence after each sweep (µs)
    pub idle_us: f64,
    pub num_chirps: usize,
    /// Frame start to frame start (ms)
    pub frame_period_ms: f64,
    /// Emission time of frame 0 (s, device time)
    pub first_frame_s: f64,
    pub amplitude: f64,
    /// Victim to sensing antenna (m)
    pub distance_m: f64,
}

impl Default for VictimConfig {
    fn default() -> Self {
        Self {
            start_frequency_mhz: 1.0,
            slope_mhz_per_us: 0.5,
            chirp_duration_us: 36.0,
            idle_us: 4.0,
            num_chirps: 8,
            frame_period_ms: 10.0,
            first_frame_s: 0.005,
            amplitude: 1.0,
            distance_m: 0.0,
        }
    }
}

/// Deterministic victim waveform, evaluated at arbitrary device times.
#[derive(Debug, Clone)]
pub struct VictimRadar {
    config: VictimConfig,
    chirp_period_s: f64,
    frame_duration_s: f64,
    frame_period_s: f64,
    delay_s: f64,
}

impl VictimRadar {
    pub fn new(config: VictimConfig) -> SimResult<Self> {
        if !config.chirp_duration_us.is_finite() || config.chirp_duration_us <= 0.0 || config.idle_us < 0.0 {
            return Err(SimError::InvalidVictim(format!(
                "chirp duration {} µs, idle {} µs",
                config.chirp_duration_us, config.idle_us
            )));
        }
        if config.num_chirps == 0 {
            return Err(SimError::InvalidVictim("a frame needs at least one chirp".into()));
        }
        if config.distance_m < 0.0 {
            return Err(SimError::InvalidVictim(format!(
                "negative distance {} m",
                config.distance_m
            )));
        }

        let chirp_period_s = (config.chirp_duration_us + config.idle_us) * 1e-6;
        let frame_duration_s = chirp_period_s * config.num_chirps as f64;
        let frame_period_s = config.frame_period_ms * 1e-3;
        if frame_period_s < frame_duration_s {
            return Err(SimError::InvalidVictim(format!(
                "frame period {} ms shorter than the {} µs frame",
                config.frame_period_ms,
                frame_duration_s * 1e6
            )));
        }

        Ok(Self {
            delay_s: config.distance_m / SPEED_OF_LIGHT,
            config,
            chirp_period_s,
            frame_duration_s,
            frame_period_s,
        })
    }

    pub fn config(&self) -> &VictimConfig {
        &self.config
    }

    /// Sweep plus idle (s)
    pub fn chirp_period_s(&self) -> f64 {
        self.chirp_period_s
    }

    pub fn frame_duration_s(&self) -> f64 {
        self.frame_duration_s
    }

    pub fn frame_period_s(&self) -> f64 {
        self.frame_period_s
    }

    /// One-way propagation delay to the sensing antenna (s)
    pub fn propagation_delay_s(&self) -> f64 {
        self.delay_s
    }

    /// Emission time of frame `k` (s)
    pub fn frame_start_s(&self, k: usize) -> f64 {
        self.config.first_frame_s + k as f64 * self.frame_period_s
    }

    /// Arrival time of frame `k` at the sensing antenna (s)
    pub fn frame_arrival_s(&self, k: usize) -> f64 {
        self.frame_start_s(k) + self.delay_s
    }

    /// Index of the frame emitted closest to `t_s`.
    pub fn nearest_frame(&self, t_s: f64) -> usize {
        let k = ((t_s - self.config.first_frame_s) / self.frame_period_s).round();
        if k > 0.0 {
            k as usize
        } else {
            0
        }
    }

    /// Received victim signal at device time `t_s`.
    pub fn sample_at(&self, t_s: f64) -> IQSample {
        let since_first = t_s - self.delay_s - self.config.first_frame_s;
        if since_first < 0.0 {
            return IQSample::new(0.0, 0.0);
        }

        let frame = (since_first / self.frame_period_s).floor();
        let in_frame = since_first - frame * self.frame_period_s;
        if in_frame >= self.frame_duration_s {
            return IQSample::new(0.0, 0.0);
        }

        let chirp = (in_frame / self.chirp_period_s).floor();
        let tau = in_frame - chirp * self.chirp_period_s;
        if tau >= self.config.chirp_duration_us * 1e-6 {
            return IQSample::new(0.0, 0.0);
        }

        let f0_hz = self.config.start_frequency_mhz * 1e6;
        let k_hz_per_s = self.config.slope_mhz_per_us * 1e12;
        let phase = 2.0 * std::f64::consts::PI * (f0_hz * tau + 0.5 * k_hz_per_s * tau * tau);
        IQSample::from_polar(self.config.amplitude, phase)
    }

    /// Write consecutive samples starting at `first_s`, sample `n` at
    /// `first_s + (offset + n) / sample_rate`.
    pub fn fill(&self, dest: &mut [IQSample], first_s: f64, offset: usize, sample_rate: f64) {
        for (n, sample) in dest.iter_mut().enumerate() {
            *sample = self.sample_at(first_s + (offset + n) as f64 / sample_rate);
        }
    }
}
