//! Per-connection protocol loop.
//!
//! Transport-agnostic: the caller adapts its socket into a stream of
//! [`InboundFrame`]s and an outbound frame channel, and owns the writer task.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::{Stream, StreamExt};
use lexstream_events::AgentEngine;
use lexstream_protocol::{ConnectionId, ProtocolError, QueryRequest, StreamEvent};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::RuntimeConfig;
use crate::registry::{ClientConnection, ConnectionRegistry, OutboundFrame};
use crate::session::StreamingSession;

/// One inbound message, decoupled from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// What happened on a connection, returned when it closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub connection_id: ConnectionId,
    pub queries_accepted: usize,
    pub queries_rejected: usize,
    pub validation_errors: usize,
}

impl ConnectionSummary {
    fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            queries_accepted: 0,
            queries_rejected: 0,
            validation_errors: 0,
        }
    }
}

#[derive(Clone)]
pub struct ConnectionHandler {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<dyn AgentEngine>,
    config: RuntimeConfig,
}

impl ConnectionHandler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<dyn AgentEngine>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<dyn AgentEngine> {
        &self.engine
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Serve one connection until the client closes it, the inbound stream
    /// ends, or `closed` is cancelled.
    ///
    /// The connection is registered for exactly as long as this future runs;
    /// registration queues the `connection_established` greeting.
    /// Validation failures are reported to the client and the loop continues.
    pub async fn serve<I>(
        &self,
        inbound: I,
        outbound: mpsc::Sender<OutboundFrame>,
        closed: CancellationToken,
    ) -> ConnectionSummary
    where
        I: Stream<Item = InboundFrame> + Send,
    {
        let connection = self.registry.register(outbound, closed);
        let span = info_span!("connection", connection_id = %connection.id());
        self.serve_registered(inbound, connection).instrument(span).await
    }

    async fn serve_registered<I>(&self, inbound: I, connection: Arc<ClientConnection>) -> ConnectionSummary
    where
        I: Stream<Item = InboundFrame> + Send,
    {
        let id = connection.id().clone();
        let mut summary = ConnectionSummary::new(id.clone());
        let mut inbound = std::pin::pin!(inbound);

        if connection.is_closed() {
            debug!("connection closed before it was greeted");
            self.teardown(&connection);
            return summary;
        }

        let limit = self.config.session_policy.max_outstanding();
        let (queries_tx, queries_rx) = mpsc::channel::<QueryRequest>(limit);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(
            self.clone()
                .run_sessions(Arc::clone(&connection), queries_rx, Arc::clone(&outstanding))
                .in_current_span(),
        );

        loop {
            let frame = tokio::select! {
                biased;
                _ = connection.closed() => break,
                frame = inbound.next() => frame,
            };
            let Some(frame) = frame else { break };
            self.registry.touch(&id);

            let text = match frame {
                InboundFrame::Text(text) => text,
                InboundFrame::Binary(bytes) => {
                    debug!(bytes = bytes.len(), "binary frame rejected");
                    summary.validation_errors += 1;
                    if self.reject_frame(&connection, &ProtocolError::UnsupportedFrame).await.is_err() {
                        break;
                    }
                    continue;
                }
                InboundFrame::Close => {
                    debug!("client sent close");
                    break;
                }
            };

            let request = match QueryRequest::parse(&text, self.config.max_query_chars) {
                Ok(request) => request,
                Err(error) => {
                    summary.validation_errors += 1;
                    if self.reject_frame(&connection, &error).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if outstanding.load(Ordering::Acquire) >= limit {
                let (reason, message) = self.config.session_policy.rejection();
                info!(reason, "query rejected");
                summary.queries_rejected += 1;
                let rejected = StreamEvent::query_rejected(&request, reason, message);
                if self.registry.deliver(&connection, &rejected).await.is_err() {
                    break;
                }
                continue;
            }

            outstanding.fetch_add(1, Ordering::AcqRel);
            if queries_tx.send(request).await.is_err() {
                break;
            }
            summary.queries_accepted += 1;
        }

        self.teardown(&connection);
        drop(queries_tx);
        if let Err(error) = worker.await {
            warn!(%error, "session worker ended abnormally");
        }
        info!(
            accepted = summary.queries_accepted,
            rejected = summary.queries_rejected,
            validation_errors = summary.validation_errors,
            "connection closed"
        );
        summary
    }

    /// Runs accepted queries one at a time, in arrival order.
    async fn run_sessions(
        self,
        connection: Arc<ClientConnection>,
        mut queries: mpsc::Receiver<QueryRequest>,
        outstanding: Arc<AtomicUsize>,
    ) {
        while let Some(request) = queries.recv().await {
            if connection.is_closed() {
                break;
            }
            let session = StreamingSession::new(
                request,
                Arc::clone(&connection),
                Arc::clone(&self.registry),
                Arc::clone(&self.engine),
                self.config.clone(),
            );
            let report = session.run().await;
            outstanding.fetch_sub(1, Ordering::AcqRel);
            if report.disconnected {
                break;
            }
            let ready = StreamEvent::ready_for_next_query();
            if self.registry.deliver(&connection, &ready).await.is_err() {
                break;
            }
        }
    }

    async fn reject_frame(
        &self,
        connection: &ClientConnection,
        error: &ProtocolError,
    ) -> crate::StreamResult<()> {
        warn!(%error, "invalid inbound message");
        self.registry
            .deliver(connection, &StreamEvent::validation_error(error))
            .await
    }

    fn teardown(&self, connection: &ClientConnection) {
        self.registry.unregister(connection.id());
        connection.close();
    }
}
