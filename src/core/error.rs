use thiserror::Error;

/// Errors raised by engine configuration. Ruin and unreachable search targets
/// are modeled outcomes and never surface here.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("model '{key}' not found, expected one of santostasi, perrenod, years")]
    UnknownModel { key: String },

    #[error("field '{field}' {reason}")]
    InvalidParameter {
        field: &'static str,
        reason: &'static str,
    },

    #[error("need at least {needed} valid historical points, got {got}")]
    InsufficientHistory { needed: usize, got: usize },

    #[error("date out of range for {days} days since genesis")]
    DateOutOfRange { days: f64 },
}

pub type EngineResult<T> = Result<T, EngineError>;
