//! Radio Abstraction
//!
//! The sensing and attacking subsystems reach the hardware only through the
//! traits in this module. A driver binding (UHD, SoapySDR, the simulator in
//! `chirpsync-sim`) implements them; the pipeline never sees device handles
//! or raw pointers, only borrowed buffer views for the duration of a call.
//!
//! ```text
//!   SensingSubsystem ──receive()──► SampleReceiver ─┐
//!                                                    ├─ shared DeviceClock
//!   AttackingSubsystem ─transmit_schedule()─► SampleTransmitter ─┘
//! ```

use crate::buffer::{BufferView, BufferViewMut};
use crate::types::IQSample;

/// Result type for radio operations
pub type RadioResult<T> = Result<T, RadioError>;

/// Errors reported by a radio binding.
///
/// Receive overflow and timeout are not errors; they come back in [`RxReport`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RadioError {
    #[error("Transmit burst holds no samples")]
    EmptyBurst,

    #[error("Invalid transmit time {0} s")]
    InvalidTime(f64),
}

/// Device time shared by the sensing and attacking radios.
pub trait DeviceClock: Send + Sync {
    /// Current device time in seconds. Monotonic.
    fn now_s(&self) -> f64;
}

/// Where a receive call starts sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamStart {
    /// Start a new stream as soon as possible
    Now,
    /// Start a new stream at this device time (s)
    At(f64),
    /// Continue the running stream with no gap
    Continue,
}

/// Outcome of one receive call. Overflow and timeout are reported, not raised.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RxReport {
    /// Samples written into the destination view
    pub samples_received: usize,
    /// Device time of the first written sample (s)
    pub first_sample_time_s: f64,
    /// Samples were lost between this call and the previous one
    pub overflow: bool,
    /// The radio did not deliver every requested sample in time
    pub timeout: bool,
}

impl RxReport {
    /// All requested samples arrived without loss.
    pub fn is_complete(&self, requested: usize) -> bool {
        !self.overflow && !self.timeout && self.samples_received == requested
    }
}

/// Outcome of a transmit schedule.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TxReport {
    /// Bursts handed to the radio
    pub bursts_sent: usize,
    /// Samples handed to the radio over all bursts
    pub samples_sent: usize,
    /// Bursts whose start time had already passed
    pub late_bursts: usize,
}

/// Receive side of the sensing radio.
pub trait SampleReceiver: Send {
    /// Fill `dest` row by row with consecutive samples.
    ///
    /// Blocks until the view is full or the radio times out.
    fn receive(&mut self, dest: BufferViewMut<'_, IQSample>, start: StreamStart) -> RxReport;

    /// Stop the running stream, if any.
    fn stop(&mut self) {}
}

/// Transmit side of the attacking radio.
pub trait SampleTransmitter: Send {
    /// Transmit the payload of `burst` once at each of `times_s` (device time,
    /// seconds). Blocks until every burst has been handed to the radio.
    fn transmit_schedule(&mut self, times_s: &[f64], burst: BufferView<'_, IQSample>)
        -> RadioResult<TxReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_report_complete() {
        let report = RxReport {
            samples_received: 100,
            first_sample_time_s: 1.0,
            overflow: false,
            timeout: false,
        };
        assert!(report.is_complete(100));
        assert!(!report.is_complete(200));
        assert!(!RxReport { overflow: true, ..report }.is_complete(100));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(RadioError::EmptyBurst.to_string(), "Transmit burst holds no samples");
        assert!(RadioError::InvalidTime(f64::NAN).to_string().contains("NaN"));
    }
}
