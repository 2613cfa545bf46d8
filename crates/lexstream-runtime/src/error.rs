use lexstream_protocol::ConnectionId;
use thiserror::Error;

/// Failures on the outbound path of one connection. Never fatal beyond that
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("connection {0} disconnected")]
    Disconnected(ConnectionId),
    #[error("outbound buffer full for connection {0}")]
    Backpressure(ConnectionId),
    #[error("failed to encode event: {0}")]
    Serialization(String),
}

pub type StreamResult<T> = Result<T, StreamError>;
