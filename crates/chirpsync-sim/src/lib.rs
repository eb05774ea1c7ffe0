//! # Simulated FMCW Victim and Radio Pair
//!
//! A pure-software stand-in for the sensing and attacking radios, so the
//! whole sensing/attack pipeline can run without hardware.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        SimTestbed                          │
//! │                                                            │
//! │  VictimRadar ──► + AwgnSource ──► SimReceiver ──► sensing  │
//! │                                                            │
//! │  attacking ──► SimTransmitter ──► TransmitLog              │
//! │                                                            │
//! │            SimClock (shared device time)                   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! In virtual mode the clock only moves as samples are received, so an
//! experiment runs as fast as the pipeline can process it. In paced mode the
//! clock follows wall time, optionally scaled.

pub mod noise;
pub mod radio;
pub mod testbed;
pub mod victim;

pub use noise::AwgnSource;
pub use radio::{ClockMode, SimClock, SimReceiver, SimTransmitter, TransmitLog, TransmittedBurst};
pub use testbed::{SimConfig, SimTestbed};
pub use victim::{VictimConfig, VictimRadar};

/// Result type for simulator construction
pub type SimResult<T> = Result<T, SimError>;

/// Errors raised while building a simulated testbed
#[derive(Debug, Clone, thiserror::Error)]
pub enum SimError {
    #[error("Invalid victim configuration: {0}")]
    InvalidVictim(String),

    #[error("Invalid noise configuration: {0}")]
    InvalidNoise(String),

    #[error("Invalid clock configuration: {0}")]
    InvalidClock(String),
}
