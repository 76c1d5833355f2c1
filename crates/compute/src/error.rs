use s2gpp_core::S2gError;

/// Errors raised while reading series, scoring windows or reconstructing scores.
#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// Malformed series or window scores. `column` is set when the problem is
    /// confined to one dimension.
    #[error("invalid input{}: {reason}", .column.map(|c| format!(" in column {c}")).unwrap_or_default())]
    InvalidInput {
        column: Option<usize>,
        reason: String,
    },

    #[error("engine '{engine}' failed: {reason}")]
    Engine { engine: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("delimited data error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Core(#[from] S2gError),
}

impl ComputeError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            column: None,
            reason: reason.into(),
        }
    }

    pub fn invalid_column(column: usize, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            column: Some(column),
            reason: reason.into(),
        }
    }

    /// The dimension this error is confined to, if any.
    pub fn column(&self) -> Option<usize> {
        match self {
            Self::InvalidInput { column, .. } => *column,
            _ => None,
        }
    }
}
