//! Agent engines behind [`lexstream_events::AgentEngine`].
//!
//! [`DemoLegalAgent`] answers from an in-memory set of case filings and is what
//! the server runs by default. [`ScriptedAgent`] replays a fixed script and is
//! used to exercise the streaming core in tests.

mod demo;
mod scripted;

pub use demo::{CaseDocument, DEMO_AGENT_NAME, DemoLegalAgent, SEARCH_TOOL_NAME};
pub use scripted::{ScriptProbe, ScriptedAgent, Step};
