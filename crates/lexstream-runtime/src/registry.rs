//! Live connection registry and fan-out.
//!
//! Each connection owns a bounded outbound channel drained by its transport
//! writer task. Broadcast uses `try_send`, so a slow or dead client never
//! stalls delivery to the others; a connection whose buffer rejects a frame
//! is cancelled and its handler tears it down.

use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use lexstream_protocol::{
    BroadcastReport, ConnectionId, ConnectionMetadata, ConnectionStatus, StatusReport, StreamEvent,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};

/// One encoded JSON text frame.
pub type OutboundFrame = Arc<str>;

/// Serialize an event into a wire frame.
pub fn encode_event(event: &StreamEvent) -> StreamResult<OutboundFrame> {
    serde_json::to_string(event)
        .map(OutboundFrame::from)
        .map_err(|error| StreamError::Serialization(error.to_string()))
}

/// Outbound half of a registered client.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    sender: mpsc::Sender<OutboundFrame>,
    closed: CancellationToken,
}

impl ClientConnection {
    fn new(id: ConnectionId, sender: mpsc::Sender<OutboundFrame>, closed: CancellationToken) -> Self {
        Self { id, sender, closed }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Queue a frame, waiting for buffer space. Fails without attempting the
    /// send once the connection is closed.
    pub async fn send(&self, frame: OutboundFrame) -> StreamResult<()> {
        if self.closed.is_cancelled() {
            return Err(StreamError::Disconnected(self.id.clone()));
        }
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(StreamError::Disconnected(self.id.clone())),
            sent = self.sender.send(frame) => sent.map_err(|_| {
                self.closed.cancel();
                StreamError::Disconnected(self.id.clone())
            }),
        }
    }

    /// Queue a frame without waiting.
    pub fn try_send(&self, frame: OutboundFrame) -> StreamResult<()> {
        if self.closed.is_cancelled() {
            return Err(StreamError::Disconnected(self.id.clone()));
        }
        self.sender.try_send(frame).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => StreamError::Backpressure(self.id.clone()),
            mpsc::error::TrySendError::Closed(_) => StreamError::Disconnected(self.id.clone()),
        })
    }

    /// Mark the connection gone. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.sender.is_closed()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.closed.cancelled() => {}
            _ = self.sender.closed() => self.closed.cancel(),
        }
    }

    /// Token cancelled when the connection goes away. Children of it are
    /// handed to engine invocations.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.closed
    }
}

#[derive(Debug)]
struct Entry {
    connection: Arc<ClientConnection>,
    metadata: ConnectionMetadata,
}

/// Every live connection, in connection order.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<IndexMap<ConnectionId, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection under a fresh id and queue its
    /// `connection_established` greeting.
    ///
    /// The greeting is queued under the table lock before the entry becomes
    /// visible, so no broadcast can overtake it. If it cannot be queued the
    /// connection is returned closed and never registered.
    pub fn register(
        &self,
        sender: mpsc::Sender<OutboundFrame>,
        closed: CancellationToken,
    ) -> Arc<ClientConnection> {
        let id = ConnectionId::new_uuid();
        let connection = Arc::new(ClientConnection::new(id.clone(), sender, closed));
        let registered = encode_event(&StreamEvent::connection_established(id.clone()))
            .and_then(|greeting| {
                let mut entries = self.entries.lock();
                connection.try_send(greeting)?;
                entries.insert(
                    id.clone(),
                    Entry {
                        connection: Arc::clone(&connection),
                        metadata: ConnectionMetadata::new(Utc::now()),
                    },
                );
                Ok(entries.len())
            });

        match registered {
            Ok(total) => info!(connection_id = %id, total, "connection registered"),
            Err(error) => {
                warn!(connection_id = %id, %error, "greeting could not be queued, connection refused");
                connection.close();
            }
        }
        connection
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let (removed, total) = {
            let mut entries = self.entries.lock();
            let removed = entries.shift_remove(id).is_some();
            (removed, entries.len())
        };
        if removed {
            info!(connection_id = %id, total, "connection unregistered");
        }
        removed
    }

    /// Advance `last_activity` to now. Returns `false` for unknown ids.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(entry) => {
                entry.metadata.touch(Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.entries
            .lock()
            .get(id)
            .map(|entry| Arc::clone(&entry.connection))
    }

    pub fn metadata(&self, id: &ConnectionId) -> Option<ConnectionMetadata> {
        self.entries.lock().get(id).map(|entry| entry.metadata)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every connection's metadata.
    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        self.entries
            .lock()
            .iter()
            .map(|(id, entry)| ConnectionStatus {
                connection_id: id.clone(),
                metadata: entry.metadata,
            })
            .collect()
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::from_connections(self.snapshot())
    }

    /// Send one event to a connection and record the activity.
    pub async fn deliver(
        &self,
        connection: &ClientConnection,
        event: &StreamEvent,
    ) -> StreamResult<()> {
        let frame = encode_event(event)?;
        connection.send(frame).await?;
        self.touch(connection.id());
        Ok(())
    }

    /// Offer `event` to every connection registered at call time.
    ///
    /// Connections that cannot accept the frame are cancelled and listed in
    /// `failed`; delivery to the rest continues.
    pub fn broadcast(&self, event: &StreamEvent) -> BroadcastReport {
        let frame = match encode_event(event) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "broadcast event could not be encoded");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let now = Utc::now();
        let mut entries = self.entries.lock();
        for (id, entry) in entries.iter_mut() {
            report.attempted += 1;
            match entry.connection.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    entry.metadata.touch(now);
                    report.delivered += 1;
                }
                Err(error) => {
                    warn!(connection_id = %id, %error, "broadcast delivery failed, closing connection");
                    entry.connection.close();
                    report.failed.push(id.clone());
                }
            }
        }
        drop(entries);

        debug!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed.len(),
            "broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lexstream_protocol::EventType;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use super::*;

    fn connect(
        registry: &ConnectionRegistry,
        buffer: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, mut rx) = mpsc::channel(buffer);
        let connection = registry.register(tx, CancellationToken::new());
        let greeting = decode(&rx.try_recv().unwrap());
        assert_eq!(greeting.event_type, EventType::ConnectionEstablished);
        (connection, rx)
    }

    fn decode(frame: &OutboundFrame) -> StreamEvent {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn register_assigns_distinct_ids() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = connect(&registry, 4);
        let (b, _rx_b) = connect(&registry, 4);
        assert_ne!(a.id(), b.id());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(a.id()).is_some());
    }

    #[test]
    fn unregister_reports_whether_it_removed() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connect(&registry, 4);
        assert!(registry.unregister(a.id()));
        assert!(!registry.unregister(a.id()));
        assert!(registry.is_empty());
        assert!(!registry.touch(a.id()));
    }

    #[test]
    fn snapshot_keeps_connection_order() {
        let registry = ConnectionRegistry::new();
        let conns: Vec<_> = (0..4).map(|_| connect(&registry, 4)).collect();
        registry.unregister(conns[1].0.id());

        let ids: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|status| status.connection_id)
            .collect();
        let expected: Vec<_> = [0, 2, 3].iter().map(|&i| conns[i].0.id().clone()).collect();
        assert_eq!(ids, expected);
        assert_eq!(registry.status().active_connections, 3);
    }

    #[tokio::test]
    async fn touch_only_moves_last_activity_forward() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = connect(&registry, 4);
        let before = registry.metadata(a.id()).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(registry.touch(a.id()));
        let after = registry.metadata(a.id()).unwrap();
        assert_eq!(after.connected_at, before.connected_at);
        assert!(after.last_activity > before.last_activity);
    }

    #[tokio::test]
    async fn deliver_sends_frame_and_records_activity() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = connect(&registry, 4);
        let before = registry.metadata(a.id()).unwrap().last_activity;
        tokio::time::sleep(Duration::from_millis(5)).await;

        registry
            .deliver(&a, &StreamEvent::ready_for_next_query())
            .await
            .unwrap();
        let event = decode(&rx.recv().await.unwrap());
        assert_eq!(event.event_type, EventType::ReadyForNextQuery);
        assert!(registry.metadata(a.id()).unwrap().last_activity > before);
    }

    #[tokio::test]
    async fn send_after_close_is_not_attempted() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx) = connect(&registry, 4);
        a.close();
        let result = registry.deliver(&a, &StreamEvent::ready_for_next_query()).await;
        assert_eq!(result, Err(StreamError::Disconnected(a.id().clone())));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receiver_closes_the_connection() {
        let registry = ConnectionRegistry::new();
        let (a, rx) = connect(&registry, 4);
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), a.closed())
            .await
            .unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_live_connection() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = connect(&registry, 4);
        let (_b, mut rx_b) = connect(&registry, 4);

        let report = registry.broadcast(&StreamEvent::broadcast("maintenance at noon", "info"));
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());

        for rx in [&mut rx_a, &mut rx_b] {
            let event = decode(&rx.recv().await.unwrap());
            assert_eq!(event.event_type, EventType::Broadcast);
            assert_eq!(event.message.as_deref(), Some("maintenance at noon"));
        }
    }

    #[tokio::test]
    async fn broadcast_isolates_a_failing_connection() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = connect(&registry, 4);
        let (b, rx_b) = connect(&registry, 4);
        let (c, mut rx_c) = connect(&registry, 4);
        drop(rx_b);

        let report = registry.broadcast(&StreamEvent::broadcast("hello", "info"));
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![b.id().clone()]);
        assert!(b.is_closed());
        assert!(!a.is_closed());
        assert!(!c.is_closed());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_c.recv().await.is_some());
    }

    #[tokio::test]
    async fn broadcast_treats_a_full_buffer_as_failure() {
        let registry = ConnectionRegistry::new();
        let (slow, _rx_slow) = connect(&registry, 1);
        let (_fast, mut rx_fast) = connect(&registry, 4);
        slow.try_send(OutboundFrame::from("{}")).unwrap();

        let report = registry.broadcast(&StreamEvent::broadcast("hello", "info"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec![slow.id().clone()]);
        assert!(slow.is_closed());
        assert!(rx_fast.recv().await.is_some());
    }

    #[test]
    fn broadcast_with_no_connections_is_empty() {
        let report = ConnectionRegistry::new().broadcast(&StreamEvent::broadcast("x", "info"));
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn register_queues_greeting_with_the_registry_id() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        let connection = registry.register(tx, CancellationToken::new());
        let greeting = decode(&rx.try_recv().unwrap());
        assert_eq!(greeting.event_type, EventType::ConnectionEstablished);
        assert_eq!(greeting.connection_id.as_ref(), Some(connection.id()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn register_refuses_a_connection_that_cannot_be_greeted() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let connection = registry.register(tx, CancellationToken::new());
        assert!(connection.is_closed());
        assert!(registry.is_empty());
    }

    /// Broadcasts as soon as a registration is logged, i.e. the earliest
    /// moment the new entry is visible to other callers.
    struct BroadcastOnRegister {
        registry: Arc<ConnectionRegistry>,
    }

    #[derive(Default)]
    struct MessageField(String);

    impl tracing::field::Visit for MessageField {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for BroadcastOnRegister {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut message = MessageField::default();
            event.record(&mut message);
            if message.0 == "connection registered" {
                self.registry
                    .broadcast(&StreamEvent::broadcast("raced registration", "info"));
            }
        }
    }

    #[test]
    fn broadcast_during_registration_follows_the_greeting() {
        let registry = Arc::new(ConnectionRegistry::new());
        let subscriber = tracing_subscriber::registry().with(BroadcastOnRegister {
            registry: Arc::clone(&registry),
        });

        let (tx, mut rx) = mpsc::channel(4);
        tracing::subscriber::with_default(subscriber, || {
            registry.register(tx, CancellationToken::new());
        });

        let first = decode(&rx.try_recv().unwrap());
        assert_eq!(first.event_type, EventType::ConnectionEstablished);
        let second = decode(&rx.try_recv().unwrap());
        assert_eq!(second.event_type, EventType::Broadcast);
        assert_eq!(second.message.as_deref(), Some("raced registration"));
    }
}
