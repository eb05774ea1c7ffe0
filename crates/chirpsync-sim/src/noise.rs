//! Additive white Gaussian noise for the simulated receiver.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use chirpsync_core::types::IQSample;

use crate::{SimError, SimResult};

/// Complex AWGN at a fixed total power.
#[derive(Debug, Clone)]
pub struct AwgnSource {
    rng: StdRng,
    dist: Normal<f64>,
    power_db: f64,
}

impl AwgnSource {
    /// Noise of total power `power_db` (dB relative to a unit-amplitude
    /// sample), split evenly over I and Q. A seed makes the sequence
    /// reproducible.
    pub fn new(power_db: f64, seed: Option<u64>) -> SimResult<Self> {
        if !power_db.is_finite() {
            return Err(SimError::InvalidNoise(format!("{} dB", power_db)));
        }
        let noise_power = 10.0_f64.powf(power_db / 10.0);
        // Divide by 2 for I and Q
        let std_dev = (noise_power / 2.0).sqrt();
        let dist = Normal::new(0.0, std_dev)
            .map_err(|e| SimError::InvalidNoise(format!("{} dB: {}", power_db, e)))?;

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self { rng, dist, power_db })
    }

    pub fn power_db(&self) -> f64 {
        self.power_db
    }

    pub fn sample(&mut self) -> IQSample {
        IQSample::new(self.dist.sample(&mut self.rng), self.dist.sample(&mut self.rng))
    }

    /// Add noise to every sample in place.
    pub fn add_to(&mut self, samples: &mut [IQSample]) {
        for s in samples {
            *s += self.sample();
        }
    }
}
