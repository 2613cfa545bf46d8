//! One query's execution and event streaming.
//!
//! A session creates its own sink, starts the engine on it in a separate task,
//! and forwards drained events to the client in order until a terminal event
//! has been sent or the client has gone.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use lexstream_events::{AgentEngine, AgentRequest, EventSink, channel};
use lexstream_protocol::{CaseId, EventType, QueryRequest, SessionId, StreamEvent};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::RuntimeConfig;
use crate::registry::{ClientConnection, ConnectionRegistry};

/// Error text when the engine's sink closed without a terminal event.
pub const UNTERMINATED_ERROR: &str = "event stream closed before a terminal event";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: SessionId,
    /// The terminal event sent, if the session got that far.
    pub terminal: Option<EventType>,
    /// Events delivered to the client, `query_received` included.
    pub forwarded: usize,
    pub disconnected: bool,
}

impl SessionReport {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            terminal: None,
            forwarded: 0,
            disconnected: false,
        }
    }
}

pub struct StreamingSession {
    id: SessionId,
    request: QueryRequest,
    connection: Arc<ClientConnection>,
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn AgentEngine>,
    config: RuntimeConfig,
}

impl StreamingSession {
    pub fn new(
        request: QueryRequest,
        connection: Arc<ClientConnection>,
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn AgentEngine>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            id: SessionId::new_uuid(),
            request,
            connection,
            registry,
            engine,
            config,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Drive the session to completion.
    ///
    /// Sends `query_received`, then every event the engine produces (thinking
    /// events only if requested), ending with exactly one terminal event unless
    /// the client disconnects first. Disconnection cancels the engine.
    pub async fn run(self) -> SessionReport {
        let span = info_span!(
            "session",
            session_id = %self.id,
            connection_id = %self.connection.id(),
            case_id = ?self.request.case_id,
        );
        self.drive().instrument(span).await
    }

    async fn drive(self) -> SessionReport {
        let mut report = SessionReport::new(self.id.clone());
        info!(query_chars = self.request.query.chars().count(), "session started");

        if self.forward(StreamEvent::query_received(&self.request)).await.is_err() {
            report.disconnected = true;
            return report;
        }
        report.forwarded += 1;

        let (sink, mut drain) = channel(self.config.sink_capacity);
        sink.push(StreamEvent::execution_start(&self.request));

        let cancel = self.connection.cancellation().child_token();
        let invocation = tokio::spawn(
            invoke(
                Arc::clone(&self.engine),
                AgentRequest::from(&self.request),
                sink,
                cancel.clone(),
                self.config.max_execution,
            )
            .in_current_span(),
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = self.connection.closed() => {
                    report.disconnected = true;
                    break;
                }
                next = drain.next() => next,
            };
            let event = match next {
                Some(event) => event,
                None => {
                    warn!("event sink closed without a terminal event");
                    StreamEvent::execution_error(
                        UNTERMINATED_ERROR,
                        &self.request.query,
                        self.request.case_id,
                    )
                }
            };
            if event.event_type.is_thinking() && !self.request.stream_thinking {
                continue;
            }

            let event_type = event.event_type.clone();
            if event_type.is_error() {
                warn!(%event_type, error = ?event.error, "forwarding error event");
            } else {
                debug!(%event_type, "forwarding event");
            }
            if let Err(error) = self.forward(event).await {
                debug!(%error, "client gone mid-stream");
                report.disconnected = true;
                break;
            }
            report.forwarded += 1;
            if event_type.is_terminal() {
                report.terminal = Some(event_type);
                break;
            }
        }

        if report.disconnected {
            cancel.cancel();
            info!(forwarded = report.forwarded, "session cancelled by disconnect");
        } else {
            info!(
                forwarded = report.forwarded,
                terminal = ?report.terminal,
                "session finished"
            );
        }
        // Detached: the engine task is bounded by the timeout and the token.
        drop(invocation);
        report
    }

    async fn forward(&self, event: StreamEvent) -> crate::StreamResult<()> {
        self.registry.deliver(&self.connection, &event).await
    }
}

/// Run the engine and seal the sink with its terminal event.
async fn invoke(
    engine: Arc<dyn AgentEngine>,
    request: AgentRequest,
    sink: EventSink,
    cancel: CancellationToken,
    max_execution: Duration,
) {
    let query = request.query.clone();
    let case_id = request.case_id;
    let execution =
        AssertUnwindSafe(engine.execute(request, sink.clone(), cancel.clone())).catch_unwind();

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(engine = engine.name(), "agent invocation cancelled");
            sink.close();
            return;
        }
        result = tokio::time::timeout(max_execution, execution) => result,
    };

    let terminal = match result {
        Ok(Ok(Ok(outcome))) => {
            debug!(engine = engine.name(), "agent invocation succeeded");
            StreamEvent::execution_complete(outcome.to_output())
        }
        Ok(Ok(Err(failure))) => {
            error!(engine = engine.name(), error = %failure, "agent invocation failed");
            failed(format!("{failure:#}"), &query, case_id)
        }
        Ok(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(engine = engine.name(), panic = %message, "agent invocation panicked");
            failed(format!("agent execution panicked: {message}"), &query, case_id)
        }
        Err(_) => {
            warn!(
                engine = engine.name(),
                timeout_ms = max_execution.as_millis() as u64,
                "agent invocation timed out"
            );
            failed(
                format!("agent execution timed out after {max_execution:?}"),
                &query,
                case_id,
            )
        }
    };

    if !sink.finish(terminal) {
        debug!("engine already reported a terminal event");
    }
}

fn failed(error: String, query: &str, case_id: Option<CaseId>) -> StreamEvent {
    StreamEvent::execution_error(error, query, case_id)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lexstream_agent::{ScriptedAgent, Step};
    use lexstream_events::{AgentOutcome, Citation};
    use lexstream_protocol::payload;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::OutboundFrame;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        connection: Arc<ClientConnection>,
        frames: mpsc::Receiver<OutboundFrame>,
    }

    impl Harness {
        fn new() -> Self {
            let registry = Arc::new(ConnectionRegistry::new());
            let (tx, mut frames) = mpsc::channel(64);
            let connection = registry.register(tx, CancellationToken::new());
            // Greeting queued by registration; sessions start after it.
            assert!(frames.try_recv().is_ok());
            Self {
                registry,
                connection,
                frames,
            }
        }

        fn session(&self, request: QueryRequest, agent: ScriptedAgent) -> StreamingSession {
            self.session_with(request, agent, RuntimeConfig::new())
        }

        fn session_with(
            &self,
            request: QueryRequest,
            agent: ScriptedAgent,
            config: RuntimeConfig,
        ) -> StreamingSession {
            StreamingSession::new(
                request,
                Arc::clone(&self.connection),
                Arc::clone(&self.registry),
                Arc::new(agent),
                config,
            )
        }

        fn received(&mut self) -> Vec<StreamEvent> {
            let mut events = Vec::new();
            while let Ok(frame) = self.frames.try_recv() {
                events.push(serde_json::from_str(&frame).unwrap());
            }
            events
        }
    }

    fn types(events: &[StreamEvent]) -> Vec<&str> {
        events.iter().map(|event| event.event_type.as_str()).collect()
    }

    fn thinking(event_type: EventType) -> Step {
        Step::Emit(StreamEvent::new(event_type).with_agent_name("Legal Research Agent"))
    }

    #[tokio::test]
    async fn successful_run_ends_with_synthesized_complete() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![
            Step::Emit(StreamEvent::new(EventType::AgentStart).with_agent_name("Legal Research Agent")),
            Step::Emit(StreamEvent::new(EventType::ToolStart).with_tool_name("Legal Document Search")),
            Step::Emit(StreamEvent::new(EventType::ToolEnd).with_tool_name("Legal Document Search")),
            Step::Return(
                AgentOutcome::new("The contract was signed on March 3.")
                    .with_citations(vec![Citation::new("contract.pdf", "Signed March 3")]),
            ),
        ]);

        let report = harness
            .session(QueryRequest::new("When was it signed?").with_case_id(4), agent)
            .run()
            .await;

        let events = harness.received();
        assert_eq!(
            types(&events),
            vec![
                "query_received",
                "agent_execution_start",
                "agent_start",
                "tool_start",
                "tool_end",
                "agent_execution_complete",
            ]
        );
        let output = events[5].output_data.as_ref().unwrap();
        assert_eq!(output["answer"], "The contract was signed on March 3.");
        assert_eq!(output["citations"][0]["source"], "contract.pdf");
        assert_eq!(events[1].input_data.as_ref().unwrap()["case_id"], 4);

        assert_eq!(report.terminal, Some(EventType::AgentExecutionComplete));
        assert_eq!(report.forwarded, 6);
        assert!(!report.disconnected);
    }

    #[tokio::test]
    async fn engine_failure_becomes_one_terminal_error() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![
            Step::Emit(StreamEvent::new(EventType::RagQueryStart)),
            Step::Fail("vector store unavailable".into()),
        ]);

        let report = harness
            .session(QueryRequest::new("Summarize").with_case_id(9), agent)
            .run()
            .await;

        let events = harness.received();
        assert_eq!(
            types(&events),
            vec!["query_received", "agent_execution_start", "rag_query_start", "agent_execution_error"]
        );
        let terminal = events.last().unwrap();
        assert!(terminal.error.as_deref().unwrap().contains("vector store unavailable"));
        let metadata = terminal.metadata.as_ref().unwrap();
        assert_eq!(metadata["query"], "Summarize");
        assert_eq!(metadata["case_id"], 9);
        assert_eq!(report.terminal, Some(EventType::AgentExecutionError));
    }

    #[tokio::test]
    async fn engine_panic_becomes_terminal_error() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![Step::Panic("index out of bounds".into())]);

        let report = harness.session(QueryRequest::new("q"), agent).run().await;

        let events = harness.received();
        let terminal = events.last().unwrap();
        assert_eq!(terminal.event_type, EventType::AgentExecutionError);
        assert!(terminal.error.as_deref().unwrap().contains("index out of bounds"));
        assert_eq!(report.terminal, Some(EventType::AgentExecutionError));
    }

    #[tokio::test]
    async fn engine_reported_terminal_is_not_duplicated() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![
            Step::Emit(StreamEvent::execution_complete(payload(json!({ "answer": "own" })))),
            Step::Emit(StreamEvent::new(EventType::AgentEnd)),
            Step::Return(AgentOutcome::new("ignored")),
        ]);

        harness.session(QueryRequest::new("q"), agent).run().await;

        let events = harness.received();
        let terminals: Vec<_> = events.iter().filter(|event| event.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].output_data.as_ref().unwrap()["answer"], "own");
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn sink_closed_without_terminal_gets_one_synthesized_error() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![
            Step::Emit(StreamEvent::new(EventType::AgentStart)),
            Step::CloseSink,
            Step::Return(AgentOutcome::new("never delivered")),
        ]);

        let report = harness
            .session(QueryRequest::new("Who filed first?").with_case_id(2), agent)
            .run()
            .await;

        let events = harness.received();
        assert_eq!(
            types(&events),
            vec!["query_received", "agent_execution_start", "agent_start", "agent_execution_error"]
        );
        let terminal = events.last().unwrap();
        assert_eq!(terminal.error.as_deref(), Some(UNTERMINATED_ERROR));
        assert_eq!(terminal.metadata.as_ref().unwrap()["case_id"], 2);
        assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
        assert_eq!(report.terminal, Some(EventType::AgentExecutionError));
    }

    #[tokio::test]
    async fn thinking_events_are_dropped_unless_requested() {
        let script = || {
            ScriptedAgent::new(vec![
                thinking(EventType::ThinkingStart),
                Step::Emit(StreamEvent::new(EventType::AgentAction)),
                thinking(EventType::ThinkingEnd),
            ])
        };

        let mut quiet = Harness::new();
        quiet
            .session(QueryRequest::new("q").with_stream_thinking(false), script())
            .run()
            .await;
        assert_eq!(
            types(&quiet.received()),
            vec!["query_received", "agent_execution_start", "agent_action", "agent_execution_complete"]
        );

        let mut verbose = Harness::new();
        verbose.session(QueryRequest::new("q"), script()).run().await;
        assert_eq!(
            types(&verbose.received()),
            vec![
                "query_received",
                "agent_execution_start",
                "thinking_start",
                "agent_action",
                "thinking_end",
                "agent_execution_complete",
            ]
        );
    }

    #[tokio::test]
    async fn timeout_produces_terminal_error() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![Step::Hang]);
        let config = RuntimeConfig::new().max_execution(Duration::from_millis(50));

        let report = harness
            .session_with(QueryRequest::new("q"), agent, config)
            .run()
            .await;

        let terminal = harness.received().pop().unwrap();
        assert_eq!(terminal.event_type, EventType::AgentExecutionError);
        assert_eq!(
            terminal.error.as_deref(),
            Some("agent execution timed out after 50ms")
        );
        assert!(!report.disconnected);
    }

    #[tokio::test]
    async fn disconnect_cancels_the_engine_and_stops_sending() {
        let mut harness = Harness::new();
        let agent = ScriptedAgent::new(vec![
            Step::Emit(StreamEvent::new(EventType::AgentStart)),
            Step::WaitForCancel,
        ]);
        let probe = agent.probe();
        let session = harness.session(QueryRequest::new("q"), agent);

        let connection = Arc::clone(&harness.connection);
        let running = tokio::spawn(session.run());
        tokio::time::timeout(Duration::from_secs(1), async {
            while probe.invocations() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        connection.close();

        let report = tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert!(report.disconnected);
        assert_eq!(report.terminal, None);

        tokio::time::timeout(Duration::from_secs(1), async {
            while !probe.cancelled() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(harness.received().iter().all(|event| !event.is_terminal()));
    }

    #[tokio::test]
    async fn closed_connection_gets_nothing() {
        let mut harness = Harness::new();
        harness.connection.close();
        let report = harness
            .session(QueryRequest::new("q"), ScriptedAgent::new(Vec::new()))
            .run()
            .await;
        assert!(report.disconnected);
        assert_eq!(report.forwarded, 0);
        assert!(harness.received().is_empty());
    }

    #[test]
    fn panic_message_reads_str_and_string_payloads() {
        assert_eq!(panic_message(&"plain"), "plain");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
