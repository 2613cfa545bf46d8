//! # lexstream-protocol: wire contract for the agent event stream
//!
//! Shared types for everything that crosses a connection: the event record and
//! its taxonomy, inbound query requests and their validation, and the status
//! and broadcast surfaces.
//!
//! Dependency-light (no tokio, no axum) so clients can depend on it directly.
//!
//! ## Module Overview
//!
//! - [`ids`]: ConnectionId, SessionId, CaseId
//! - [`event`]: StreamEvent + EventType (forward-compatible tags)
//! - [`message`]: QueryRequest and inbound validation
//! - [`status`]: ConnectionMetadata, StatusReport, BroadcastRequest/Report
//! - [`error`]: ProtocolError, ProtocolResult

pub mod error;
pub mod event;
pub mod ids;
pub mod message;
pub mod status;

pub use error::{ProtocolError, ProtocolResult};
pub use event::{CONNECTED_MESSAGE, EventType, Payload, READY_MESSAGE, StreamEvent, payload};
pub use ids::{CaseId, ConnectionId, SessionId};
pub use message::{DEFAULT_MAX_QUERY_CHARS, QueryRequest};
pub use status::{
    BroadcastReport, BroadcastRequest, ConnectionMetadata, ConnectionStatus, StatusReport,
};
