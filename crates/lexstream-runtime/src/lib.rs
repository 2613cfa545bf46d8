//! Streaming core: who is connected, and how one query's events reach them.
//!
//! - [`registry`]: live connections, status snapshots, broadcast fan-out
//! - [`session`]: one query: engine invocation plus ordered forwarding
//! - [`handler`]: per-connection protocol loop over a transport-agnostic stream
//! - [`config`]: execution bound, queue sizes, overlapping-query policy

pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod session;

pub use config::{RuntimeConfig, SessionPolicy};
pub use error::{StreamError, StreamResult};
pub use handler::{ConnectionHandler, ConnectionSummary, InboundFrame};
pub use registry::{ClientConnection, ConnectionRegistry, OutboundFrame, encode_event};
pub use session::{SessionReport, StreamingSession, UNTERMINATED_ERROR};
