//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use s2gpp_cluster::ClusterConfig;
use s2gpp_compute::{AnomalyEngine, ComputeError, TimeSeries, WindowedScoreSeries};
use s2gpp_core::{ModelParameters, ParameterInput};

/// Scores each window with its first value, optionally stalling on some
/// columns so tests can control the order in which nodes finish.
#[derive(Default)]
pub struct FirstValueEngine {
    pub stall: Vec<(usize, Duration)>,
    /// Columns whose scores come out as NaN.
    pub poisoned: Vec<usize>,
}

impl FirstValueEngine {
    pub fn stalling(column: usize, delay: Duration) -> Self {
        Self {
            stall: vec![(column, delay)],
            ..Self::default()
        }
    }
}

impl AnomalyEngine for FirstValueEngine {
    fn name(&self) -> &str {
        "first-value"
    }

    fn window_length(&self, params: &ModelParameters) -> usize {
        params.query_length
    }

    fn score_windows(
        &self,
        params: &ModelParameters,
        series: &TimeSeries,
    ) -> Result<Vec<WindowedScoreSeries>, ComputeError> {
        for (column, delay) in &self.stall {
            if series.column_range().contains(*column) {
                std::thread::sleep(*delay);
            }
        }
        let w = self.window_length(params);
        Ok(series
            .columns()
            .map(|(c, values)| {
                let scores = values
                    .windows(w)
                    .map(|win| if self.poisoned.contains(&c) { f64::NAN } else { win[0] })
                    .collect();
                WindowedScoreSeries::new(c, w, scores)
            })
            .collect())
    }
}

/// Window length 3.
pub fn params() -> ModelParameters {
    ParameterInput {
        query_length: Some(3),
        ..ParameterInput::new(9)
    }
    .resolve_with_parallelism(2)
    .unwrap()
}

/// `n_columns` columns of `n_rows` rows; cell `(r, c)` holds `100 * c + r`.
pub fn series(n_rows: usize, n_columns: usize) -> TimeSeries {
    let columns = (0..n_columns)
        .map(|c| (0..n_rows).map(|r| (100 * c + r) as f64).collect())
        .collect();
    TimeSeries::from_columns(0, columns).unwrap()
}

/// The same series as delimited text with a header row.
pub fn series_csv(n_rows: usize, n_columns: usize) -> String {
    let header: Vec<String> = (0..n_columns).map(|c| format!("dim{c}")).collect();
    let mut text = header.join(",") + "\n";
    for r in 0..n_rows {
        let row: Vec<String> = (0..n_columns).map(|c| (100 * c + r).to_string()).collect();
        text.push_str(&row.join(","));
        text.push('\n');
    }
    text
}

/// Timeouts short enough for tests, retries generous enough for start-up races.
pub fn fast_config() -> ClusterConfig {
    ClusterConfig {
        accept_timeout_secs: 10,
        handshake_timeout_secs: 2,
        assignment_timeout_secs: 10,
        dispatch_timeout_secs: 10,
        collect_timeout_secs: 10,
        report_timeout_secs: 10,
        connect_attempts: 40,
        connect_backoff_ms: 50,
        connect_timeout_secs: 1,
        ..ClusterConfig::default()
    }
}
