//! Core types shared across the sensing pipeline
//!
//! Samples coming off the sensing radio are complex baseband I/Q values.
//! Everything downstream of the receiver (energy detection, spectrogram,
//! regression) works in `f64`, which is also the element type written to
//! the raw debug dumps.
//!
//! Time and frequency units follow the radar convention used by every stage:
//!
//! | Quantity          | Unit   |
//! |-------------------|--------|
//! | spectrogram time  | µs     |
//! | spectrogram freq  | MHz    |
//! | chirp slope       | MHz/µs |
//! | device clock      | s      |
//! | attack schedule   | ms     |

use num_complex::Complex64;

use crate::buffer::BufferError;
use crate::config::ConfigError;
use crate::rt::RtError;

/// Type alias for complex numbers using f64 precision
pub type Complex = Complex64;

/// A single I/Q sample point
pub type IQSample = Complex64;

/// Speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Result type for pipeline construction and experiment runs
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that stop a sensing or attacking subsystem from being built or run.
///
/// Transient radio conditions (overflow, timeout) never surface here; they
/// are logged and the affected frame is dropped.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("thread error: {0}")]
    Thread(#[from] RtError),

    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    #[error("noise floor calibration failed: {0}")]
    Calibration(String),
}

/// Convert a linear power/magnitude ratio to decibels (`10·log10`).
///
/// Zero maps to negative infinity, which keeps silent rows out of every
/// "greater than" comparison the detectors make.
#[inline]
pub fn to_db(value: f64) -> f64 {
    10.0 * value.log10()
}
