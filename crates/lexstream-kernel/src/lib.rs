use std::sync::Arc;

use anyhow::{Result, ensure};
use futures_util::Stream;
use lexstream_events::AgentEngine;
use lexstream_protocol::{BroadcastReport, BroadcastRequest, StatusReport, StreamEvent};
use lexstream_runtime::{
    ConnectionHandler, ConnectionRegistry, ConnectionSummary, InboundFrame, OutboundFrame,
    RuntimeConfig,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

#[derive(Clone)]
pub struct StreamKernelBuilder {
    engine: Arc<dyn AgentEngine>,
    config: RuntimeConfig,
}

impl StreamKernelBuilder {
    pub fn new(engine: Arc<dyn AgentEngine>) -> Self {
        Self {
            engine,
            config: RuntimeConfig::default(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> StreamKernel {
        let registry = Arc::new(ConnectionRegistry::new());
        let handler = ConnectionHandler::new(Arc::clone(&registry), self.engine, self.config);
        StreamKernel { registry, handler }
    }
}

#[derive(Clone)]
pub struct StreamKernel {
    registry: Arc<ConnectionRegistry>,
    handler: ConnectionHandler,
}

impl StreamKernel {
    /// Serve one client connection until it closes. See
    /// [`ConnectionHandler::serve`].
    pub async fn serve_connection<I>(
        &self,
        inbound: I,
        outbound: mpsc::Sender<OutboundFrame>,
        closed: CancellationToken,
    ) -> ConnectionSummary
    where
        I: Stream<Item = InboundFrame> + Send,
    {
        self.handler.serve(inbound, outbound, closed).await
    }

    pub fn status(&self) -> StatusReport {
        self.registry.status()
    }

    /// Send an administrative notice to every connected client.
    #[instrument(skip(self, request), fields(kind = %request.kind))]
    pub fn broadcast(&self, request: &BroadcastRequest) -> Result<BroadcastReport> {
        ensure!(
            !request.message.trim().is_empty(),
            "broadcast message must not be empty"
        );
        let event = StreamEvent::broadcast(&request.message, &request.kind);
        Ok(self.registry.broadcast(&event))
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn engine_name(&self) -> &str {
        self.handler.engine().name()
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.handler.config()
    }
}
