use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::Stream;
use lexstream_protocol::StreamEvent;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Default per-session queue bound.
pub const DEFAULT_SINK_CAPACITY: usize = 10_000;

/// Queue bound for one sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCapacity {
    /// Grow without limit; the producer is never throttled.
    Unbounded,
    /// Keep at most `n` queued events, discarding the oldest on overflow.
    Bounded(usize),
}

impl Default for SinkCapacity {
    fn default() -> Self {
        Self::Bounded(DEFAULT_SINK_CAPACITY)
    }
}

#[derive(Debug, Default)]
struct SinkState {
    queue: VecDeque<StreamEvent>,
    closed: bool,
    terminal: bool,
    dropped: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SinkState>,
    notify: Notify,
    capacity: SinkCapacity,
    producers: AtomicUsize,
}

impl Shared {
    fn enqueue(&self, state: &mut SinkState, event: StreamEvent) {
        if event.is_terminal() {
            state.terminal = true;
        }
        if let SinkCapacity::Bounded(max) = self.capacity
            && state.queue.len() >= max.max(1)
        {
            if let Some(oldest) = state.queue.pop_front() {
                state.dropped += 1;
                warn!(
                    dropped_type = %oldest.event_type,
                    dropped_total = state.dropped,
                    "event sink full, dropping oldest event"
                );
            }
        }
        state.queue.push_back(event);
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(pending = state.queue.len(), "event sink closed");
        }
        drop(state);
        self.notify.notify_one();
    }
}

/// Create a connected producer/consumer pair.
pub fn channel(capacity: SinkCapacity) -> (EventSink, EventDrain) {
    let shared = Arc::new(Shared {
        state: Mutex::new(SinkState::default()),
        notify: Notify::new(),
        capacity,
        producers: AtomicUsize::new(1),
    });
    (
        EventSink {
            shared: Arc::clone(&shared),
        },
        EventDrain { shared },
    )
}

/// Write side of a session's event queue.
///
/// `push` never blocks. Events pushed after `close`, or after a terminal event,
/// are dropped and `push` returns `false`. Dropping the last handle closes the
/// sink.
#[derive(Debug)]
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    pub fn push(&self, event: StreamEvent) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed || state.terminal {
            debug!(
                event_type = %event.event_type,
                closed = state.closed,
                "event pushed after sink was sealed, dropping"
            );
            return false;
        }
        self.shared.enqueue(&mut state, event);
        drop(state);
        self.shared.notify.notify_one();
        true
    }

    /// Push `event` unless a terminal event was already pushed, then close.
    /// Returns whether `event` was queued.
    pub fn finish(&self, event: StreamEvent) -> bool {
        let mut state = self.shared.state.lock();
        let pushed = !state.closed && !state.terminal;
        if pushed {
            self.shared.enqueue(&mut state, event);
        }
        state.closed = true;
        drop(state);
        self.shared.notify.notify_one();
        pushed
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn has_terminal(&self) -> bool {
        self.shared.state.lock().terminal
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Clone for EventSink {
    fn clone(&self) -> Self {
        self.shared.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        if self.shared.producers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.close();
        }
    }
}

/// Read side of a session's event queue.
#[derive(Debug)]
pub struct EventDrain {
    shared: Arc<Shared>,
}

impl EventDrain {
    /// Wait for the next event. Returns `None` once the sink is closed and empty.
    ///
    /// If events were discarded on overflow, an `events_dropped` warning is
    /// yielded before the next retained event.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if state.dropped > 0 {
                    let dropped = std::mem::take(&mut state.dropped);
                    return Some(StreamEvent::events_dropped(dropped));
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`EventDrain::next`].
    pub fn try_next(&mut self) -> Option<StreamEvent> {
        let mut state = self.shared.state.lock();
        if state.dropped > 0 {
            let dropped = std::mem::take(&mut state.dropped);
            return Some(StreamEvent::events_dropped(dropped));
        }
        state.queue.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_stream(mut self) -> impl Stream<Item = StreamEvent> + Send {
        async_stream::stream! {
            while let Some(event) = self.next().await {
                yield event;
            }
        }
    }
}
