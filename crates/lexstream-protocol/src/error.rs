//! Errors raised while decoding inbound client messages.

use thiserror::Error;

/// A malformed inbound message. Reported to the offending connection only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format")]
    InvalidJson,
    #[error("Message must be a JSON object")]
    NotAnObject,
    #[error("Missing '{0}' field in message")]
    MissingField(&'static str),
    #[error("Invalid '{field}' field: expected {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },
    #[error("'query' must not be empty")]
    EmptyQuery,
    #[error("'query' exceeds {max} characters")]
    QueryTooLong { max: usize },
    #[error("Binary frames are not supported; send JSON text")]
    UnsupportedFrame,
}

impl ProtocolError {
    /// The inbound field the error refers to, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::MissingField(field) | Self::InvalidField { field, .. } => Some(field),
            Self::EmptyQuery | Self::QueryTooLong { .. } => Some("query"),
            Self::InvalidJson | Self::NotAnObject | Self::UnsupportedFrame => None,
        }
    }
}

/// Convenience result type for protocol decoding.
pub type ProtocolResult<T> = Result<T, ProtocolError>;
