use thiserror::Error;

#[derive(Error, Debug)]
pub enum S2gError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, S2gError>;
