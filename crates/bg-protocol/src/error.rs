//! Protocol error types

use thiserror::Error;

/// Errors that can occur while parsing or encoding protocol lines
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A line exceeded the codec limit
    #[error("Line too long: {size} bytes exceeds maximum of {max} bytes")]
    LineTooLong { size: usize, max: usize },

    /// A line was not valid UTF-8
    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    /// A recognized message prefix with a body that does not parse
    #[error("Malformed {kind} message: {line}")]
    Malformed { kind: &'static str, line: String },

    /// Structured payload carries a schema version this build does not speak
    #[error("Unsupported payload version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(kind: &'static str, line: &str) -> Self {
        Self::Malformed {
            kind,
            line: line.to_string(),
        }
    }
}
