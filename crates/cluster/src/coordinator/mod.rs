//! The two sides of the rendezvous protocol.
//!
//! [`MainCoordinator`] accepts sub nodes, ships each its column slice,
//! scores its own columns meanwhile, then merges and reconstructs every
//! dimension. [`SubWorker`] dials the coordinator, scores what it is given
//! and reports back.

pub mod main_node;
pub mod sub_node;

pub use main_node::MainCoordinator;
pub use sub_node::SubWorker;

use s2gpp_compute::{reconstruct_all, ReconstructedScoreSeries, ReductionMode, WindowedScoreSeries};

use crate::error::ClusterError;

/// Reconstruct every dimension; any failed dimension fails the whole set.
pub fn reconstruct_strict(
    series: &[WindowedScoreSeries],
    mode: ReductionMode,
) -> Result<Vec<ReconstructedScoreSeries>, ClusterError> {
    let mut failures = Vec::new();
    let mut out = Vec::with_capacity(series.len());
    for (windowed, result) in series.iter().zip(reconstruct_all(series, mode)) {
        match result {
            Ok(r) => out.push(r),
            Err(e) => failures.push((windowed.column, e.to_string())),
        }
    }
    if failures.is_empty() {
        Ok(out)
    } else {
        Err(ClusterError::Reconstruction { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_reconstruction_collects_every_failure() {
        let series = vec![
            WindowedScoreSeries::new(0, 2, vec![1.0, 2.0]),
            WindowedScoreSeries::new(1, 2, vec![f64::NAN]),
            WindowedScoreSeries::new(2, 2, vec![]),
        ];
        match reconstruct_strict(&series, ReductionMode::Mean) {
            Err(ClusterError::Reconstruction { failures }) => {
                let columns: Vec<usize> = failures.iter().map(|(c, _)| *c).collect();
                assert_eq!(columns, vec![1, 2]);
            }
            other => panic!("expected reconstruction failure, got {other:?}"),
        }
        let ok = reconstruct_strict(&series[..1], ReductionMode::Sum).unwrap();
        assert_eq!(ok[0].scores, vec![1.0, 3.0, 2.0]);
    }
}
