//! FFT Utilities for Spectrogram Generation
//!
//! Thin wrapper around a planned `rustfft` forward transform with its own
//! scratch space, plus the helpers the spectrogram uses to turn a transformed
//! window into a magnitude row and pick its strongest bin.
//!
//! ```text
//!  windowed row (fft_size I/Q)  ──FFT──►  X[k]  ──10·log10|X[k]|──►  dB row
//!                                                                      │
//!                                                        find_peak ◄───┘
//! ```

use rustfft::{num_complex::Complex64, Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

use crate::types::to_db;

/// Forward FFT processor for one window size
pub struct FftProcessor {
    /// FFT size
    size: usize,
    /// Forward FFT instance
    fft_forward: Arc<dyn Fft<f64>>,
    /// Scratch buffer for FFT operations
    scratch: Vec<Complex64>,
}

impl fmt::Debug for FftProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftProcessor")
            .field("size", &self.size)
            .finish()
    }
}

impl Clone for FftProcessor {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            fft_forward: Arc::clone(&self.fft_forward),
            scratch: vec![Complex64::new(0.0, 0.0); self.scratch.len()],
        }
    }
}

impl FftProcessor {
    /// Create a new FFT processor for the given size
    pub fn new(size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft_forward = planner.plan_fft_forward(size);
        let scratch = vec![Complex64::new(0.0, 0.0); fft_forward.get_inplace_scratch_len()];

        Self {
            size,
            fft_forward,
            scratch,
        }
    }

    /// Get the FFT size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Shared handle to the planned transform, for use from worker threads
    pub fn plan(&self) -> Arc<dyn Fft<f64>> {
        Arc::clone(&self.fft_forward)
    }

    /// Compute the forward FFT in-place
    pub fn fft_inplace(&mut self, buffer: &mut [Complex64]) {
        debug_assert_eq!(buffer.len(), self.size);
        self.fft_forward.process_with_scratch(buffer, &mut self.scratch);
    }
}

/// Write `10·log10(|X[k]|)` for every bin of `spectrum` into `out`.
pub fn magnitude_db(spectrum: &[Complex64], out: &mut [f64]) {
    for (dst, x) in out.iter_mut().zip(spectrum) {
        *dst = to_db(x.norm());
    }
}

/// Find the strongest value.
///
/// Returns `(index, value)` of the first maximum; ties keep the lower index.
/// An empty slice yields `(0, -inf)`.
pub fn find_peak(values: &[f64]) -> (usize, f64) {
    let mut max_idx = 0;
    let mut max_val = match values.first() {
        Some(&v) => v,
        None => return (0, f64::NEG_INFINITY),
    };

    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > max_val {
            max_val = v;
            max_idx = i;
        }
    }

    (max_idx, max_val)
}
