//! # FMCW Sensing and Predictive Synchronization
//!
//! This crate turns a stream of raw I/Q buffers from a sensing radio into
//! estimates of a victim FMCW radar's waveform (chirp slope, chirp period,
//! frame period, frame start time), predicts when the victim's next frame
//! will start, and hands those predictions to a second radio that transmits
//! an attack frame aligned to it.
//!
//! ## Overview
//!
//! - **Energy detection**: noise-floor calibrated chirp presence test over a
//!   small ring of the most recent receive rows
//! - **Spectrogram estimation**: Hann-windowed FFTs, per-row peak picking,
//!   chirp segmentation and least-squares slope fitting
//! - **Frame tracking**: per-frame aggregation and next-frame prediction
//! - **Synchronization**: a bounded schedule shared between the sensing and
//!   attacking threads
//!
//! ## Signal Flow
//!
//! ```text
//! RX rows → EnergyDetector → capture → Spectrogram → peaks → clusters → fits
//!                                                                        │
//! TX ← AttackingSubsystem ← SyncBridge ← prediction ← FrameTracker ◄─────┘
//! ```
//!
//! Radios are reached only through the traits in [`hal`]; the
//! `chirpsync-sim` crate provides a simulated victim and radio pair.
//!
//! ## Example
//!
//! ```rust,no_run
//! use chirpsync_core::spectrogram::{SpectrogramConfig, SpectrogramHandler};
//!
//! let mut handler = SpectrogramHandler::new(SpectrogramConfig {
//!     sample_rate: 25e6,
//!     rx_samples_per_buffer: 2000,
//!     min_recording_time_ms: 0.3,
//!     peak_threshold_db: 8.0,
//!     min_points_per_chirp: 4,
//!     max_frames_to_capture: 20,
//!     parallel_fft: false,
//! })
//! .unwrap();
//!
//! // Fill handler.capture_mut() from the radio, then:
//! handler.set_detection_start_time_us(1_000.0, 0.0);
//! if let Some(frame) = handler.process_received_signal() {
//!     println!("{} chirps at {:.3} MHz/us", frame.chirp_count, frame.avg_slope_mhz_per_us);
//! }
//! ```

pub mod attacking;
pub mod buffer;
pub mod config;
pub mod energy_detector;
pub mod estimation;
pub mod experiment;
pub mod fft_utils;
pub mod frame_tracker;
pub mod hal;
pub mod io;
pub mod rt;
pub mod sensing;
pub mod spectrogram;
pub mod sync;
pub mod types;

// Re-export main types
pub use attacking::{AttackReport, AttackState, AttackingSubsystem};
pub use buffer::{BufferError, BufferShape, BufferView, BufferViewMut, SampleBuffer};
pub use config::{ConfigError, ExperimentConfig};
pub use energy_detector::{ChirpDetectionWindow, EnergyDetector};
pub use estimation::{ChirpEstimate, LinearFit};
pub use experiment::{Experiment, ExperimentReport};
pub use frame_tracker::{FrameRecord, FrameSummary, FrameTracker};
pub use hal::{DeviceClock, RadioError, RxReport, SampleReceiver, SampleTransmitter, StreamStart, TxReport};
pub use io::IqFormat;
pub use sensing::{CaptureOutcome, SensingReport, SensingSubsystem};
pub use spectrogram::{SpectrogramConfig, SpectrogramGeometry, SpectrogramHandler};
pub use sync::{PublishOutcome, SyncBridge};
pub use types::{Complex, IQSample, PipelineError, PipelineResult};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::ExperimentConfig;
    pub use crate::experiment::{Experiment, ExperimentReport};
    pub use crate::hal::{DeviceClock, RxReport, SampleReceiver, SampleTransmitter, StreamStart, TxReport};
    pub use crate::spectrogram::SpectrogramHandler;
    pub use crate::sync::SyncBridge;
    pub use crate::types::{IQSample, PipelineError, PipelineResult};
}
