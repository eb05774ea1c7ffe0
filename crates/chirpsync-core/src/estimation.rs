//! Chirp segmentation and slope fitting
//!
//! After peak extraction the spectrogram is reduced to one (time, frequency)
//! point per time bin. For a linear FMCW frame those points form rising
//! ramps, one per chirp, separated by a drop back to the start frequency:
//!
//! ```text
//!  f │    ╱    ╱    ╱
//!    │   ╱    ╱    ╱
//!    │  ╱    ╱    ╱
//!    │ ╱    ╱    ╱
//!    └──────────────── t
//!      id 1 id 2 id 3
//! ```
//!
//! [`assign_clusters`] labels each ramp, and [`fit_line`] recovers its slope
//! and the time at which it crossed 0 MHz.

use std::ops::Range;

/// Line fitted to a chirp's (time, frequency) points: `f = intercept + slope·t`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    /// Frequency at t = 0 (MHz)
    pub intercept: f64,
    /// Sweep rate (MHz/µs)
    pub slope: f64,
}

impl LinearFit {
    /// Time at which the fitted line crosses 0 MHz (µs). `None` for a flat line.
    pub fn zero_crossing(&self) -> Option<f64> {
        if self.slope == 0.0 || !self.slope.is_finite() {
            None
        } else {
            Some(-self.intercept / self.slope)
        }
    }
}

/// One chirp of the victim frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChirpEstimate {
    /// Sweep rate (MHz/µs)
    pub slope_mhz_per_us: f64,
    /// Absolute chirp start on the device clock (µs)
    pub start_time_us: f64,
}

impl ChirpEstimate {
    /// Turn a fit in capture-relative time into an absolute estimate.
    ///
    /// `detection_start_time_us` is the device time of the first captured
    /// sample, already corrected for propagation delay.
    pub fn from_fit(fit: &LinearFit, detection_start_time_us: f64) -> Option<Self> {
        let t0 = fit.zero_crossing()?;
        Some(Self {
            slope_mhz_per_us: fit.slope,
            start_time_us: t0 + detection_start_time_us,
        })
    }
}

/// Ordinary least-squares fit of `freqs` on `times`.
///
/// Closed-form solution of the normal equations in centred form. Returns
/// `None` with fewer than two points or when every time is identical.
pub fn fit_line(times: &[f64], freqs: &[f64]) -> Option<LinearFit> {
    let n = times.len().min(freqs.len());
    if n < 2 {
        return None;
    }

    let nf = n as f64;
    let t_mean = times[..n].iter().sum::<f64>() / nf;
    let f_mean = freqs[..n].iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (&t, &f) in times[..n].iter().zip(&freqs[..n]) {
        let dt = t - t_mean;
        sxx += dt * dt;
        sxy += dt * (f - f_mean);
    }

    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    Some(LinearFit {
        intercept: f_mean - slope * t_mean,
        slope,
    })
}

/// Label runs of strictly increasing frequency.
///
/// `ids[i]` receives the cluster id of point `i`: runs of at least
/// `min_points` get ids 1, 2, … in scan order, shorter runs get −1, and
/// cells of `ids` beyond `freqs.len()` are zeroed. A frequency that does not
/// rise above its predecessor always starts a new run.
///
/// Returns the index range of each valid cluster, in id order.
pub fn assign_clusters(freqs: &[f64], min_points: usize, ids: &mut [i32]) -> Vec<Range<usize>> {
    ids.fill(0);
    let n = freqs.len().min(ids.len());
    let mut clusters = Vec::new();
    if n == 0 {
        return clusters;
    }

    let mut run_start = 0;
    for i in 1..=n {
        let run_ends = i == n || freqs[i] <= freqs[i - 1];
        if !run_ends {
            continue;
        }

        if i - run_start >= min_points {
            clusters.push(run_start..i);
            ids[run_start..i].fill(clusters.len() as i32);
        } else {
            ids[run_start..i].fill(-1);
        }
        run_start = i;
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_fit_exact_line() {
        let a = 3.5;
        let b = 0.75;
        let times: Vec<f64> = (0..10).map(|i| 1.0 + 2.0 * i as f64).collect();
        let freqs: Vec<f64> = times.iter().map(|t| a + b * t).collect();

        let fit = fit_line(&times, &freqs).unwrap();
        assert_relative_eq!(fit.slope, b, epsilon = 1e-12);
        assert_relative_eq!(fit.intercept, a, epsilon = 1e-12);
    }

    #[test]
    fn test_fit_degenerate() {
        assert!(fit_line(&[1.0], &[2.0]).is_none());
        assert!(fit_line(&[4.0, 4.0, 4.0], &[1.0, 2.0, 3.0]).is_none());

        let flat = fit_line(&[0.0, 1.0, 2.0], &[5.0, 5.0, 5.0]).unwrap();
        assert_eq!(flat.slope, 0.0);
        assert!(flat.zero_crossing().is_none());
    }

    #[test]
    fn test_chirp_estimate_start_time() {
        // f = -2 + 0.5·t crosses zero at t = 4 µs
        let fit = LinearFit {
            intercept: -2.0,
            slope: 0.5,
        };
        let est = ChirpEstimate::from_fit(&fit, 1000.0).unwrap();
        assert_relative_eq!(est.start_time_us, 1004.0);
        assert_relative_eq!(est.slope_mhz_per_us, 0.5);
    }

    #[test]
    fn test_cluster_run_at_threshold() {
        let freqs = [1.0, 2.0, 3.0, 4.0];
        let mut ids = [0; 4];

        let clusters = assign_clusters(&freqs, 4, &mut ids);
        assert_eq!(clusters, vec![0..4]);
        assert_eq!(ids, [1, 1, 1, 1]);

        let clusters = assign_clusters(&freqs, 5, &mut ids);
        assert!(clusters.is_empty());
        assert_eq!(ids, [-1, -1, -1, -1]);
    }

    #[test]
    fn test_decrease_ends_cluster() {
        // rise, drop, rise, flat step, short rise
        let freqs = [1.0, 2.0, 3.0, 0.5, 1.5, 2.5, 3.5, 3.5, 4.0];
        let mut ids = [9; 12];

        let clusters = assign_clusters(&freqs, 3, &mut ids);

        assert_eq!(clusters, vec![0..3, 3..7]);
        assert_eq!(ids, [1, 1, 1, 2, 2, 2, 2, -1, -1, 0, 0, 0]);
    }

    #[test]
    fn test_ids_skip_invalid_runs() {
        let freqs = [5.0, 1.0, 2.0, 3.0];
        let mut ids = [0; 4];

        let clusters = assign_clusters(&freqs, 2, &mut ids);
        assert_eq!(clusters, vec![1..4]);
        assert_eq!(ids, [-1, 1, 1, 1]);
    }

    #[test]
    fn test_no_points() {
        let mut ids = [7; 3];
        assert!(assign_clusters(&[], 2, &mut ids).is_empty());
        assert_eq!(ids, [0, 0, 0]);
    }
}
