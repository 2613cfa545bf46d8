//! Deterministic engine that plays back a fixed list of steps.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use lexstream_events::{AgentEngine, AgentOutcome, AgentRequest, EventSink};
use lexstream_protocol::StreamEvent;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Step {
    /// Push an event into the sink.
    Emit(StreamEvent),
    /// Sleep, returning early with an error if cancelled.
    Sleep(Duration),
    /// Park until the cancellation token fires.
    WaitForCancel,
    /// Never finish and ignore cancellation.
    Hang,
    /// Close the sink without pushing a terminal event.
    CloseSink,
    Fail(String),
    Panic(String),
    Return(AgentOutcome),
}

#[derive(Debug, Default)]
struct Counters {
    invocations: AtomicUsize,
    completions: AtomicUsize,
    cancellations: AtomicUsize,
}

/// Observes a [`ScriptedAgent`] from outside.
#[derive(Debug, Clone, Default)]
pub struct ScriptProbe {
    counters: Arc<Counters>,
}

impl ScriptProbe {
    pub fn invocations(&self) -> usize {
        self.counters.invocations.load(Ordering::Acquire)
    }

    /// Invocations that ran to a result (success, failure, or panic).
    pub fn completions(&self) -> usize {
        self.counters.completions.load(Ordering::Acquire)
    }

    /// Whether any invocation was cancelled or dropped before finishing.
    pub fn cancelled(&self) -> bool {
        self.counters.cancellations.load(Ordering::Acquire) > 0
    }
}

/// Counts an invocation as cancelled unless it is marked finished before drop.
struct RunGuard {
    probe: ScriptProbe,
    finished: bool,
}

impl RunGuard {
    fn start(probe: &ScriptProbe) -> Self {
        probe.counters.invocations.fetch_add(1, Ordering::AcqRel);
        Self {
            probe: probe.clone(),
            finished: false,
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.probe.counters.completions.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.probe.counters.cancellations.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    name: String,
    steps: Vec<Step>,
    probe: ScriptProbe,
}

impl ScriptedAgent {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            name: "Scripted Agent".to_owned(),
            steps,
            probe: ScriptProbe::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn probe(&self) -> ScriptProbe {
        self.probe.clone()
    }
}

#[async_trait]
impl AgentEngine for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _request: AgentRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let mut guard = RunGuard::start(&self.probe);
        for step in &self.steps {
            match step {
                Step::Emit(event) => {
                    events.push(event.clone());
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        _ = cancel.cancelled() => bail!("cancelled"),
                        _ = tokio::time::sleep(*duration) => {}
                    }
                }
                Step::WaitForCancel => {
                    cancel.cancelled().await;
                    bail!("cancelled");
                }
                Step::Hang => std::future::pending::<()>().await,
                Step::CloseSink => events.close(),
                Step::Fail(message) => {
                    guard.finish();
                    bail!("{message}");
                }
                Step::Panic(message) => {
                    guard.finish();
                    panic!("{message}");
                }
                Step::Return(outcome) => {
                    guard.finish();
                    return Ok(outcome.clone());
                }
            }
        }
        guard.finish();
        Ok(AgentOutcome::default())
    }
}
