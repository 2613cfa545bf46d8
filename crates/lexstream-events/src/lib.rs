//! Event capture for one streaming session.
//!
//! An engine writes into an [`EventSink`]; the session reads the matching
//! [`EventDrain`]. The two sides share nothing else.

mod callbacks;
mod engine;
mod sink;

pub use callbacks::AgentCallbacks;
pub use engine::{AgentEngine, AgentOutcome, AgentRequest, CITATION_EXCERPT_CHARS, Citation};
pub use sink::{DEFAULT_SINK_CAPACITY, EventDrain, EventSink, SinkCapacity, channel};
