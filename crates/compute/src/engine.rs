use std::path::Path;

use s2gpp_core::ModelParameters;
use tracing::info;

use crate::error::ComputeError;
use crate::reconstruction::{reconstruct_all, ReconstructedScoreSeries, ReductionMode, WindowedScoreSeries};
use crate::series::TimeSeries;

/// An anomaly-detection engine the coordination layer can drive.
///
/// The only required computation is [`score_windows`](Self::score_windows):
/// every node of a distributed run calls it on its own column slice. The
/// local call shapes are provided on top of it; the distributed ones live in
/// the cluster dispatcher so engines never see the network.
pub trait AnomalyEngine: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Length `W` of the windows this engine scores for `params`.
    fn window_length(&self, params: &ModelParameters) -> usize;

    /// Score every window of every column in `series`.
    ///
    /// Returns one [`WindowedScoreSeries`] per column, in column order, using
    /// the global column indices of `series`.
    fn score_windows(
        &self,
        params: &ModelParameters,
        series: &TimeSeries,
    ) -> Result<Vec<WindowedScoreSeries>, ComputeError>;

    /// Score an in-memory series and reconstruct per-timestamp scores.
    fn local_array(
        &self,
        params: &ModelParameters,
        series: &TimeSeries,
        mode: ReductionMode,
    ) -> Result<Vec<ReconstructedScoreSeries>, ComputeError> {
        let start = std::time::Instant::now();
        let windowed = self.score_windows(params, series)?;
        let reconstructed = reconstruct_all(&windowed, mode)
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            engine = self.name(),
            columns = reconstructed.len(),
            rows = series.n_rows(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "local scoring done"
        );
        Ok(reconstructed)
    }

    /// Read a delimited series file, then behave like [`local_array`](Self::local_array).
    fn local_file(
        &self,
        params: &ModelParameters,
        path: &Path,
        mode: ReductionMode,
    ) -> Result<Vec<ReconstructedScoreSeries>, ComputeError> {
        let series = TimeSeries::read_delimited(path)?;
        self.local_array(params, &series, mode)
    }
}
