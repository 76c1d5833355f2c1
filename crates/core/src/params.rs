use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, S2gError};

/// Clustering strategy the engine uses for node estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusteringMethod {
    Kde,
    MeanShift,
}

impl ClusteringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kde => "kde",
            Self::MeanShift => "meanshift",
        }
    }
}

impl fmt::Display for ClusteringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusteringMethod {
    type Err = S2gError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kde" => Ok(Self::Kde),
            "meanshift" => Ok(Self::MeanShift),
            other => Err(S2gError::InvalidParameter(format!(
                "unknown clustering method '{other}' (expected 'kde' or 'meanshift')"
            ))),
        }
    }
}

/// Validated engine parameters, shared unchanged by every node of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub pattern_length: usize,
    pub latent: usize,
    pub rate: usize,
    pub query_length: usize,
    pub n_threads: usize,
    pub clustering: ClusteringMethod,
    pub self_correction: bool,
}

/// Raw user-supplied parameters, before defaults are derived.
///
/// Signed integers so that out-of-range input can be reported instead of
/// wrapping. `None` or `0` for `latent`/`query_length` means "derive it";
/// `n_threads <= 0` means "use the default thread count".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterInput {
    pub pattern_length: i64,
    pub latent: Option<i64>,
    pub rate: i64,
    pub query_length: Option<i64>,
    pub n_threads: i64,
    pub clustering: ClusteringMethod,
    pub self_correction: bool,
}

impl Default for ParameterInput {
    fn default() -> Self {
        Self {
            pattern_length: 50,
            latent: None,
            rate: 100,
            query_length: None,
            n_threads: -1,
            clustering: ClusteringMethod::Kde,
            self_correction: false,
        }
    }
}

impl ParameterInput {
    pub fn new(pattern_length: i64) -> Self {
        Self {
            pattern_length,
            ..Self::default()
        }
    }

    /// Resolve against the parallelism reported by the OS.
    pub fn resolve(&self) -> Result<ModelParameters> {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.resolve_with_parallelism(available)
    }

    /// Resolve with an explicit logical core count (used by `resolve`).
    pub fn resolve_with_parallelism(&self, available_parallelism: usize) -> Result<ModelParameters> {
        if self.pattern_length <= 0 {
            return Err(S2gError::InvalidParameter(format!(
                "pattern_length must be positive, got {}",
                self.pattern_length
            )));
        }
        if self.rate <= 0 {
            return Err(S2gError::InvalidParameter(format!(
                "rate must be positive, got {}",
                self.rate
            )));
        }
        let pattern_length = self.pattern_length as usize;

        let latent = match explicit_or_unset("latent", self.latent)? {
            Some(latent) => latent,
            None => pattern_length / 3,
        };
        if latent == 0 {
            return Err(S2gError::InvalidParameter(format!(
                "derived latent is 0 for pattern_length {pattern_length}; pass an explicit latent"
            )));
        }

        let query_length = explicit_or_unset("query_length", self.query_length)?
            .unwrap_or(pattern_length);

        let n_threads = if self.n_threads > 0 {
            self.n_threads as usize
        } else {
            default_thread_count(available_parallelism)
        };

        Ok(ModelParameters {
            pattern_length,
            latent,
            rate: self.rate as usize,
            query_length,
            n_threads,
            clustering: self.clustering,
            self_correction: self.self_correction,
        })
    }
}

/// `Some(0)` is treated like `None`; negative values are rejected.
fn explicit_or_unset(name: &str, value: Option<i64>) -> Result<Option<usize>> {
    match value {
        None | Some(0) => Ok(None),
        Some(v) if v < 0 => Err(S2gError::InvalidParameter(format!(
            "{name} must not be negative, got {v}"
        ))),
        Some(v) => Ok(Some(v as usize)),
    }
}

/// Default worker thread count: `min(available_parallelism - 1, 1)`.
///
/// This is 1 on every machine with at least two cores, so multi-threaded
/// engine runs need an explicit `n_threads`. It looks unintended but is the
/// documented behavior. A single-core machine would yield 0; that is raised
/// to 1.
pub fn default_thread_count(available_parallelism: usize) -> usize {
    let n = available_parallelism.saturating_sub(1).min(1);
    if n == 0 {
        1
    } else {
        n
    }
}
