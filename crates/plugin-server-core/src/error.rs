//! Error types for event intake and filter decoding.

use thiserror::Error;

/// Result type alias for intake operations.
pub type Result<T> = std::result::Result<T, IntakeError>;

/// Errors raised while turning a raw queue message into an [`crate::Event`].
///
/// Both variants are terminal for the message: it is dead-lettered and never
/// retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntakeError {
    /// The payload is not JSON, or a field has the wrong shape.
    #[error("decode error: {0}")]
    Decode(String),

    /// The payload parsed but the envelope is semantically invalid.
    #[error("validation error: {field}: {reason}")]
    Validation {
        /// Envelope field that failed validation.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },
}

impl IntakeError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Short label used for metrics and dead-letter records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Validation { .. } => "validation",
        }
    }
}

impl From<serde_json::Error> for IntakeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Errors raised while decoding a persisted filter payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterCodecError {
    /// Payload ended before a complete value was read.
    #[error("filter payload truncated at byte {0}")]
    Truncated(usize),

    /// Unknown format version byte.
    #[error("unsupported filter version {0}")]
    UnsupportedVersion(u8),

    /// A property name was not valid UTF-8.
    #[error("filter entry is not valid UTF-8")]
    InvalidUtf8,

    /// Bytes left over after the declared entries.
    #[error("{0} trailing bytes after filter entries")]
    TrailingBytes(usize),
}
