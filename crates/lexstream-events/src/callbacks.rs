use lexstream_protocol::{CaseId, EventType, Payload, StreamEvent, payload};
use serde_json::{Value, json};

use crate::sink::EventSink;

/// Typed instrumentation hooks an engine calls as it works. Each hook builds
/// one event and pushes it into the session's sink.
#[derive(Debug, Clone)]
pub struct AgentCallbacks {
    sink: EventSink,
}

impl AgentCallbacks {
    pub fn new(sink: EventSink) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Push an arbitrary pre-built event.
    pub fn emit(&self, event: StreamEvent) -> bool {
        self.sink.push(event)
    }

    /// Push a bare event of any type, including tags unknown to this build.
    pub fn emit_type(&self, event_type: &str) -> bool {
        self.emit(StreamEvent::new(EventType::parse(event_type)))
    }

    pub fn on_agent_start(&self, agent_name: &str, task: &str) {
        self.emit(
            StreamEvent::new(EventType::AgentStart)
                .with_agent_name(agent_name)
                .with_task(task),
        );
    }

    pub fn on_agent_action(&self, agent_name: &str, action: &str, input: Payload) {
        self.emit(
            StreamEvent::new(EventType::AgentAction)
                .with_agent_name(agent_name)
                .with_action(action)
                .with_input(input),
        );
    }

    pub fn on_agent_observation(&self, agent_name: &str, observation: &str) {
        self.emit(
            StreamEvent::new(EventType::AgentObservation)
                .with_agent_name(agent_name)
                .with_output(payload(json!({ "observation": observation }))),
        );
    }

    pub fn on_agent_end(&self, agent_name: &str, result: &str) {
        self.emit(
            StreamEvent::new(EventType::AgentEnd)
                .with_agent_name(agent_name)
                .with_output(payload(json!({ "result": result }))),
        );
    }

    pub fn on_chain_start(&self, chain_name: &str, inputs: Payload) {
        self.emit(
            StreamEvent::new(EventType::ChainStart)
                .with_agent_name(chain_name)
                .with_input(inputs),
        );
    }

    pub fn on_chain_end(&self, chain_name: &str, outputs: Payload) {
        self.emit(
            StreamEvent::new(EventType::ChainEnd)
                .with_agent_name(chain_name)
                .with_output(outputs),
        );
    }

    pub fn on_tool_start(&self, tool_name: &str, input: &str) {
        self.emit(
            StreamEvent::new(EventType::ToolStart)
                .with_tool_name(tool_name)
                .with_input(payload(json!({ "input": input }))),
        );
    }

    pub fn on_tool_end(&self, tool_name: &str, output: &str) {
        self.emit(
            StreamEvent::new(EventType::ToolEnd)
                .with_tool_name(tool_name)
                .with_output(payload(json!({ "output": output }))),
        );
    }

    pub fn on_llm_start(&self, llm_name: &str, messages: Vec<Value>) {
        self.emit(
            StreamEvent::new(EventType::LlmStart)
                .with_agent_name(llm_name)
                .with_input(payload(json!({ "messages": messages }))),
        );
    }

    pub fn on_llm_end(&self, llm_name: &str, response: &str) {
        self.emit(
            StreamEvent::new(EventType::LlmEnd)
                .with_agent_name(llm_name)
                .with_output(payload(json!({ "response": response }))),
        );
    }

    pub fn on_llm_error(&self, llm_name: &str, error: &str) {
        self.emit(
            StreamEvent::new(EventType::LlmError)
                .with_agent_name(llm_name)
                .with_error(error),
        );
    }

    pub fn on_rag_query_start(&self, query: &str, case_id: Option<CaseId>) {
        self.emit(
            StreamEvent::new(EventType::RagQueryStart)
                .with_input(payload(json!({ "query": query, "case_id": case_id }))),
        );
    }

    pub fn on_rag_query_end(&self, result: Payload) {
        self.emit(StreamEvent::new(EventType::RagQueryEnd).with_output(result));
    }

    pub fn on_thinking_start(&self, agent_name: &str, thought: &str) {
        self.emit(
            StreamEvent::new(EventType::ThinkingStart)
                .with_agent_name(agent_name)
                .with_input(payload(json!({ "thought": thought }))),
        );
    }

    pub fn on_thinking_end(&self, agent_name: &str, conclusion: &str) {
        self.emit(
            StreamEvent::new(EventType::ThinkingEnd)
                .with_agent_name(agent_name)
                .with_output(payload(json!({ "conclusion": conclusion }))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SinkCapacity, channel};

    #[tokio::test]
    async fn hooks_populate_the_fields_their_type_guarantees() {
        let (sink, mut drain) = channel(SinkCapacity::Unbounded);
        let callbacks = AgentCallbacks::new(sink);

        callbacks.on_agent_start("Legal Question Answering Agent", "answer the question");
        callbacks.on_tool_start("rag_search", "defendant response");
        callbacks.on_llm_error("gpt", "rate limited");
        callbacks.on_rag_query_start("defendant response", Some(1));
        callbacks.on_thinking_end("Legal Question Answering Agent", "cite the answer");
        drop(callbacks);

        let start = drain.next().await.unwrap();
        assert_eq!(start.event_type, EventType::AgentStart);
        assert_eq!(start.agent_name.as_deref(), Some("Legal Question Answering Agent"));
        assert_eq!(start.task.as_deref(), Some("answer the question"));

        let tool = drain.next().await.unwrap();
        assert_eq!(tool.tool_name.as_deref(), Some("rag_search"));
        assert_eq!(tool.input_data.unwrap()["input"], "defendant response");

        let llm = drain.next().await.unwrap();
        assert_eq!(llm.error.as_deref(), Some("rate limited"));

        let rag = drain.next().await.unwrap();
        assert_eq!(rag.input_data.unwrap()["case_id"], 1);

        let thinking = drain.next().await.unwrap();
        assert_eq!(thinking.output_data.unwrap()["conclusion"], "cite the answer");

        assert!(drain.next().await.is_none());
    }

    #[tokio::test]
    async fn emit_type_accepts_unknown_tags() {
        let (sink, mut drain) = channel(SinkCapacity::Unbounded);
        let callbacks = AgentCallbacks::new(sink);
        assert!(callbacks.emit_type("citation_verified"));
        let event = drain.next().await.unwrap();
        assert_eq!(event.event_type.as_str(), "citation_verified");
    }
}
