//! Window-score reconstruction.
//!
//! The engine scores fixed-length sliding windows: window `p` describes the
//! timestamps `[p, p + W)`. Reconstruction maps those `m` window scores back
//! onto the `W - 1 + m` timestamps they cover. Timestamp `t` is covered by the
//! windows `p` in `[max(0, t - W + 1), min(t, m - 1)]`, which is `W` windows in
//! the interior but only `t + 1` on the leading edge and `W - 1 + m - t` on the
//! trailing edge.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::ComputeError;

/// How overlapping window scores collapse into one score per timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReductionMode {
    /// Mean over the windows that actually cover the timestamp.
    #[default]
    Mean,
    /// Plain sum of the covering windows.
    Sum,
}

impl fmt::Display for ReductionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => f.write_str("mean"),
            Self::Sum => f.write_str("sum"),
        }
    }
}

impl FromStr for ReductionMode {
    type Err = ComputeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(Self::Mean),
            "sum" => Ok(Self::Sum),
            other => Err(ComputeError::invalid(format!(
                "unknown reduction '{other}' (expected 'mean' or 'sum')"
            ))),
        }
    }
}

/// One score per sliding window of one dimension, as the engine emits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedScoreSeries {
    /// Global dimension index.
    pub column: usize,
    pub window_length: usize,
    pub scores: Vec<f64>,
}

impl WindowedScoreSeries {
    pub fn new(column: usize, window_length: usize, scores: Vec<f64>) -> Self {
        Self {
            column,
            window_length,
            scores,
        }
    }

    /// Number of timestamps the windows span.
    pub fn timestamps(&self) -> usize {
        (self.window_length + self.scores.len()).saturating_sub(1)
    }

    pub fn reconstruct(&self, mode: ReductionMode) -> Result<ReconstructedScoreSeries, ComputeError> {
        let scores = reconstruct(&self.scores, self.window_length, mode)
            .map_err(|e| pin_column(e, self.column))?;
        Ok(ReconstructedScoreSeries {
            column: self.column,
            scores,
        })
    }
}

/// One score per original timestamp of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedScoreSeries {
    pub column: usize,
    pub scores: Vec<f64>,
}

impl ReconstructedScoreSeries {
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Reconstruct per-timestamp scores from `scores` of windows of `window_length`.
///
/// The output has `window_length - 1 + scores.len()` entries. Sums are taken
/// in ascending window order, so `Mean` at an interior timestamp is exactly
/// the `Sum` value divided by `window_length`.
pub fn reconstruct(
    scores: &[f64],
    window_length: usize,
    mode: ReductionMode,
) -> Result<Vec<f64>, ComputeError> {
    if window_length == 0 {
        return Err(ComputeError::invalid("window length must be positive"));
    }
    if scores.is_empty() {
        return Err(ComputeError::invalid("no window scores to reconstruct"));
    }
    if let Some(p) = scores.iter().position(|s| !s.is_finite()) {
        return Err(ComputeError::invalid(format!(
            "window score {p} is not finite ({})",
            scores[p]
        )));
    }

    let m = scores.len();
    let total = window_length - 1 + m;
    let output = (0..total)
        .map(|t| {
            let first = (t + 1).saturating_sub(window_length);
            let last = t.min(m - 1);
            let covering = &scores[first..=last];
            let sum: f64 = covering.iter().sum();
            match mode {
                ReductionMode::Sum => sum,
                ReductionMode::Mean => sum / covering.len() as f64,
            }
        })
        .collect();
    Ok(output)
}

/// Reconstruct to a known series length, deriving `W = total_timestamps - m + 1`.
pub fn reconstruct_to_length(
    scores: &[f64],
    total_timestamps: usize,
    mode: ReductionMode,
) -> Result<Vec<f64>, ComputeError> {
    if scores.is_empty() || total_timestamps < scores.len() {
        return Err(ComputeError::invalid(format!(
            "{} window scores cannot span {total_timestamps} timestamps",
            scores.len()
        )));
    }
    reconstruct(scores, total_timestamps - scores.len() + 1, mode)
}

/// Reconstruct every dimension independently, in parallel.
///
/// Results keep the input order. A failing dimension only fails its own
/// entry.
pub fn reconstruct_all(
    series: &[WindowedScoreSeries],
    mode: ReductionMode,
) -> Vec<Result<ReconstructedScoreSeries, ComputeError>> {
    series.par_iter().map(|s| s.reconstruct(mode)).collect()
}

fn pin_column(err: ComputeError, column: usize) -> ComputeError {
    match err {
        ComputeError::InvalidInput { column: None, reason } => ComputeError::InvalidInput {
            column: Some(column),
            reason,
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sum_of_small_example() {
        let out = reconstruct(&[1.0, 2.0, 3.0], 2, ReductionMode::Sum).unwrap();
        assert_eq!(out, vec![1.0, 3.0, 5.0, 3.0]);
    }

    #[test]
    fn mean_of_small_example() {
        let out = reconstruct(&[1.0, 2.0, 3.0], 2, ReductionMode::Mean).unwrap();
        assert_eq!(out, vec![1.0, 1.5, 2.5, 3.0]);
    }

    #[test]
    fn mean_edges_are_not_divided_by_window_length() {
        let scores = [4.0, 4.0, 4.0, 4.0, 4.0, 4.0];
        let out = reconstruct(&scores, 3, ReductionMode::Mean).unwrap();
        // A constant signal stays constant everywhere, edges included.
        assert!(out.iter().all(|&v| v == 4.0), "{out:?}");
    }

    #[test]
    fn window_one_is_identity() {
        let scores = [0.3, -1.0, 7.5];
        assert_eq!(reconstruct(&scores, 1, ReductionMode::Mean).unwrap(), scores);
        assert_eq!(reconstruct(&scores, 1, ReductionMode::Sum).unwrap(), scores);
    }

    #[test]
    fn window_longer_than_scores() {
        // m = 2, W = 4: no timestamp is covered by all 4 windows.
        let out = reconstruct(&[2.0, 6.0], 4, ReductionMode::Mean).unwrap();
        assert_eq!(out, vec![2.0, 4.0, 4.0, 4.0, 6.0]);
        let out = reconstruct(&[2.0, 6.0], 4, ReductionMode::Sum).unwrap();
        assert_eq!(out, vec![2.0, 8.0, 8.0, 8.0, 6.0]);
    }

    #[test]
    fn rejects_degenerate_input() {
        assert!(reconstruct(&[1.0], 0, ReductionMode::Mean).is_err());
        assert!(reconstruct(&[], 3, ReductionMode::Mean).is_err());
        assert!(reconstruct(&[1.0, f64::NAN], 2, ReductionMode::Sum).is_err());
        assert!(reconstruct(&[f64::INFINITY], 2, ReductionMode::Sum).is_err());
    }

    #[test]
    fn derive_window_from_total_length() {
        let out = reconstruct_to_length(&[1.0, 2.0, 3.0], 4, ReductionMode::Sum).unwrap();
        assert_eq!(out, vec![1.0, 3.0, 5.0, 3.0]);
        assert!(reconstruct_to_length(&[1.0, 2.0, 3.0], 2, ReductionMode::Sum).is_err());
    }

    #[test]
    fn failures_stay_in_their_dimension() {
        let series = vec![
            WindowedScoreSeries::new(0, 2, vec![1.0, 2.0, 3.0]),
            WindowedScoreSeries::new(1, 2, vec![1.0, f64::NAN]),
            WindowedScoreSeries::new(2, 0, vec![1.0]),
            WindowedScoreSeries::new(3, 3, vec![5.0]),
        ];
        let results = reconstruct_all(&series, ReductionMode::Mean);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().scores, vec![1.0, 1.5, 2.5, 3.0]);
        assert_eq!(results[1].as_ref().unwrap_err().column(), Some(1));
        assert_eq!(results[2].as_ref().unwrap_err().column(), Some(2));
        assert_eq!(results[3].as_ref().unwrap().scores, vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn reduction_mode_parses() {
        assert_eq!("mean".parse::<ReductionMode>().unwrap(), ReductionMode::Mean);
        assert_eq!(" SUM ".parse::<ReductionMode>().unwrap(), ReductionMode::Sum);
        assert!("median".parse::<ReductionMode>().is_err());
    }

    fn window_case() -> impl Strategy<Value = (Vec<f64>, usize)> {
        (prop::collection::vec(-1.0e3f64..1.0e3, 1..40), 1usize..12)
    }

    proptest! {
        #[test]
        fn sum_length_and_interior((scores, w) in window_case()) {
            let out = reconstruct(&scores, w, ReductionMode::Sum).unwrap();
            let m = scores.len();
            prop_assert_eq!(out.len(), w - 1 + m);
            if w <= m {
                for t in (w - 1)..m {
                    let expected: f64 = scores[t + 1 - w..=t].iter().sum();
                    prop_assert_eq!(out[t], expected);
                }
            }
        }

        #[test]
        fn mean_interior_is_sum_over_window((scores, w) in window_case()) {
            let sum = reconstruct(&scores, w, ReductionMode::Sum).unwrap();
            let mean = reconstruct(&scores, w, ReductionMode::Mean).unwrap();
            let m = scores.len();
            if w <= m {
                for t in (w - 1)..m {
                    prop_assert_eq!(mean[t], sum[t] / w as f64);
                }
            }
        }

        #[test]
        fn mean_boundaries_equal_single_window((scores, w) in window_case()) {
            let mean = reconstruct(&scores, w, ReductionMode::Mean).unwrap();
            prop_assert_eq!(mean[0], scores[0]);
            prop_assert_eq!(mean[mean.len() - 1], scores[scores.len() - 1]);
        }

        #[test]
        fn reconstruction_is_deterministic((scores, w) in window_case()) {
            for mode in [ReductionMode::Mean, ReductionMode::Sum] {
                let a = reconstruct(&scores, w, mode).unwrap();
                let b = reconstruct(&scores, w, mode).unwrap();
                let a_bits: Vec<u64> = a.iter().map(|v| v.to_bits()).collect();
                let b_bits: Vec<u64> = b.iter().map(|v| v.to_bits()).collect();
                prop_assert_eq!(a_bits, b_bits);
            }
        }
    }
}
