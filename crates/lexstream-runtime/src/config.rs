use std::time::Duration;

use lexstream_events::SinkCapacity;
use lexstream_protocol::DEFAULT_MAX_QUERY_CHARS;

/// What happens to a query that arrives while another is in flight on the
/// same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Refuse it with a `query_rejected` event.
    #[default]
    Reject,
    /// Run it after the current one, keeping at most `max_pending` waiting.
    Queue { max_pending: usize },
}

impl SessionPolicy {
    /// In-flight plus waiting queries a connection may hold.
    pub fn max_outstanding(&self) -> usize {
        match self {
            Self::Reject => 1,
            Self::Queue { max_pending } => max_pending.saturating_add(1),
        }
    }

    /// Wire reason and human text for a refused query.
    pub fn rejection(&self) -> (&'static str, &'static str) {
        match self {
            Self::Reject => (
                "session_in_flight",
                "A query is already in progress on this connection",
            ),
            Self::Queue { .. } => (
                "queue_full",
                "Too many queries are waiting on this connection",
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on one engine invocation.
    pub max_execution: Duration,
    pub sink_capacity: SinkCapacity,
    /// Frames buffered per connection ahead of the transport writer.
    pub outbound_buffer: usize,
    pub session_policy: SessionPolicy,
    pub max_query_chars: usize,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self {
            max_execution: Duration::from_secs(300),
            sink_capacity: SinkCapacity::default(),
            outbound_buffer: 256,
            session_policy: SessionPolicy::default(),
            max_query_chars: DEFAULT_MAX_QUERY_CHARS,
        }
    }

    pub fn max_execution(mut self, max_execution: Duration) -> Self {
        self.max_execution = max_execution;
        self
    }

    pub fn sink_capacity(mut self, sink_capacity: SinkCapacity) -> Self {
        self.sink_capacity = sink_capacity;
        self
    }

    pub fn outbound_buffer(mut self, outbound_buffer: usize) -> Self {
        self.outbound_buffer = outbound_buffer.max(1);
        self
    }

    pub fn session_policy(mut self, session_policy: SessionPolicy) -> Self {
        self.session_policy = session_policy;
        self
    }

    pub fn max_query_chars(mut self, max_query_chars: usize) -> Self {
        self.max_query_chars = max_query_chars;
        self
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}
