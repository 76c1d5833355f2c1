//! Reference window scorer based on discord distance.
//!
//! Each window is scored by the z-normalised Euclidean distance to its
//! nearest non-overlapping neighbour window: windows whose shape recurs
//! elsewhere score low, one-off shapes score high. This is a brute-force
//! O(m² · W) search per column, adequate for moderate series and as a
//! stand-in wherever the full S2G engine is not linked in.

use rayon::prelude::*;
use s2gpp_core::ModelParameters;
use tracing::debug;

use crate::engine::AnomalyEngine;
use crate::error::ComputeError;
use crate::reconstruction::WindowedScoreSeries;
use crate::series::TimeSeries;

/// Standard deviations below this are treated as flat windows.
const FLAT_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscordEngine;

impl DiscordEngine {
    pub fn new() -> Self {
        Self
    }

    fn score_column(column: usize, values: &[f64], w: usize) -> Result<Vec<f64>, ComputeError> {
        if values.len() < w {
            return Err(ComputeError::invalid_column(
                column,
                format!("{} rows are fewer than the window length {w}", values.len()),
            ));
        }
        let windows = values.len() - w + 1;
        let stats: Vec<(f64, f64)> = values.windows(w).map(mean_std).collect();
        let exclusion = (w / 2).max(1);

        let scores = (0..windows)
            .into_par_iter()
            .map(|i| {
                (0..windows)
                    .filter(|&j| i.abs_diff(j) >= exclusion)
                    .map(|j| z_distance(&values[i..i + w], stats[i], &values[j..j + w], stats[j]))
                    .fold(None, |best: Option<f64>, d| Some(best.map_or(d, |b| b.min(d))))
                    .unwrap_or(0.0)
            })
            .collect();
        Ok(scores)
    }
}

impl AnomalyEngine for DiscordEngine {
    fn name(&self) -> &str {
        "discord"
    }

    fn window_length(&self, params: &ModelParameters) -> usize {
        params.query_length
    }

    fn score_windows(
        &self,
        params: &ModelParameters,
        series: &TimeSeries,
    ) -> Result<Vec<WindowedScoreSeries>, ComputeError> {
        let w = self.window_length(params);
        if w == 0 {
            return Err(ComputeError::invalid("window length must be positive"));
        }
        debug!(
            engine = self.name(),
            window = w,
            threads = params.n_threads,
            clustering = %params.clustering,
            columns = %series.column_range(),
            "scoring windows"
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.n_threads)
            .build()
            .map_err(|e| ComputeError::Engine {
                engine: self.name().to_string(),
                reason: format!("failed to build thread pool: {e}"),
            })?;

        pool.install(|| {
            series
                .columns()
                .map(|(column, values)| {
                    let mut scores = Self::score_column(column, values, w)?;
                    if params.self_correction {
                        min_max_normalize(&mut scores);
                    }
                    Ok(WindowedScoreSeries::new(column, w, scores))
                })
                .collect()
        })
    }
}

fn mean_std(window: &[f64]) -> (f64, f64) {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn z_value(v: f64, (mean, std): (f64, f64)) -> f64 {
    if std < FLAT_EPSILON {
        0.0
    } else {
        (v - mean) / std
    }
}

fn z_distance(a: &[f64], a_stats: (f64, f64), b: &[f64], b_stats: (f64, f64)) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (z_value(x, a_stats) - z_value(y, b_stats)).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Rescale to `[0, 1]`; a constant series becomes all zeros.
fn min_max_normalize(scores: &mut [f64]) {
    let (min, max) = scores
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = max - min;
    for s in scores.iter_mut() {
        *s = if span > 0.0 { (*s - min) / span } else { 0.0 };
    }
}
