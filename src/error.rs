use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Errors raised by the dub pipeline stages. Each stage signals its own kind
/// and the orchestrator surfaces it unchanged.
#[derive(Debug, Error)]
pub enum DubError {
    #[error("synthesis failed: {0}")]
    Synthesis(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("insufficient footage: {0}")]
    InsufficientFootage(String),

    #[error("duration mismatch: {0}")]
    DurationMismatch(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("job cancelled")]
    Cancelled,
}

pub type DubResult<T> = Result<T, DubError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Synthesis,
    ModelUnavailable,
    InsufficientFootage,
    DurationMismatch,
    Encoding,
    Configuration,
    Cancelled,
}

impl DubError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DubError::Synthesis(_) => ErrorKind::Synthesis,
            DubError::ModelUnavailable(_) => ErrorKind::ModelUnavailable,
            DubError::InsufficientFootage(_) => ErrorKind::InsufficientFootage,
            DubError::DurationMismatch(_) => ErrorKind::DurationMismatch,
            DubError::Encoding(_) => ErrorKind::Encoding,
            DubError::Configuration(_) => ErrorKind::Configuration,
            DubError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Synthesis => "SynthesisError",
            ErrorKind::ModelUnavailable => "ModelUnavailableError",
            ErrorKind::InsufficientFootage => "InsufficientFootageError",
            ErrorKind::DurationMismatch => "DurationMismatchError",
            ErrorKind::Encoding => "EncodingError",
            ErrorKind::Configuration => "ConfigurationError",
            ErrorKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(DubError::Encoding("x".into()).kind(), ErrorKind::Encoding);
        assert_eq!(DubError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            ErrorKind::InsufficientFootage.to_string(),
            "InsufficientFootageError"
        );
    }
}
