//! Self-contained legal research agent for running the server without an
//! external model or vector store.
//!
//! Retrieval is keyword overlap over an in-memory set of case filings; the
//! answer is assembled from the best passages. The lifecycle it reports
//! (agent, tool, retrieval, LLM, thinking) matches what a real engine emits.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use lexstream_events::{
    AgentCallbacks, AgentEngine, AgentOutcome, AgentRequest, Citation, EventSink,
};
use lexstream_protocol::{CaseId, payload};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

pub const DEMO_AGENT_NAME: &str = "Legal Research Agent";
pub const SEARCH_TOOL_NAME: &str = "Legal Document Search";
const MODEL_NAME: &str = "lexstream-demo-llm";
const SYSTEM_PROMPT: &str = "You are a legal research assistant. Answer only from the \
    retrieved case filings and cite the documents you rely on.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDocument {
    pub case_id: CaseId,
    pub source: String,
    pub text: String,
}

impl CaseDocument {
    pub fn new(case_id: CaseId, source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            case_id,
            source: source.into(),
            text: text.into(),
        }
    }
}

pub struct DemoLegalAgent {
    documents: Vec<CaseDocument>,
    step_delay: Duration,
    top_k: usize,
}

impl DemoLegalAgent {
    pub fn new(documents: Vec<CaseDocument>) -> Self {
        Self {
            documents,
            step_delay: Duration::ZERO,
            top_k: 3,
        }
    }

    /// Agent preloaded with two small sample cases.
    pub fn with_sample_documents() -> Self {
        Self::new(sample_documents())
    }

    /// Pause between lifecycle phases, to make streaming visible.
    pub fn step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = step_delay;
        self
    }

    pub fn top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    /// Best-matching passages, restricted to `case_id` when given.
    pub fn retrieve(&self, query: &str, case_id: Option<CaseId>) -> Vec<&CaseDocument> {
        let query_terms = terms(query);
        let mut scored: Vec<(usize, &CaseDocument)> = self
            .documents
            .iter()
            .filter(|doc| case_id.is_none_or(|id| doc.case_id == id))
            .map(|doc| (query_terms.intersection(&terms(&doc.text)).count(), doc))
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(self.top_k).map(|(_, doc)| doc).collect()
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        if self.step_delay.is_zero() {
            if cancel.is_cancelled() {
                bail!("cancelled");
            }
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => bail!("cancelled"),
            _ = tokio::time::sleep(self.step_delay) => Ok(()),
        }
    }
}

#[async_trait]
impl AgentEngine for DemoLegalAgent {
    fn name(&self) -> &str {
        DEMO_AGENT_NAME
    }

    #[instrument(skip_all, fields(case_id = ?request.case_id))]
    async fn execute(
        &self,
        request: AgentRequest,
        events: EventSink,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let callbacks = AgentCallbacks::new(events);
        let prompt = request.prompt();

        callbacks.on_agent_start(DEMO_AGENT_NAME, &prompt);
        callbacks.on_thinking_start(
            DEMO_AGENT_NAME,
            "Deciding which filings could answer the question",
        );
        self.pause(&cancel).await?;

        callbacks.on_agent_action(
            DEMO_AGENT_NAME,
            "search_legal_documents",
            payload(json!({ "query": request.query, "case_id": request.case_id })),
        );
        callbacks.on_tool_start(SEARCH_TOOL_NAME, &prompt);
        callbacks.on_rag_query_start(&request.query, request.case_id);
        self.pause(&cancel).await?;

        let hits = self.retrieve(&request.query, request.case_id);
        let citations: Vec<Citation> = hits
            .iter()
            .map(|doc| Citation::new(doc.source.clone(), &doc.text))
            .collect();
        debug!(hits = hits.len(), "retrieval finished");
        callbacks.on_rag_query_end(payload(json!({
            "retrieved_chunks": hits.len(),
            "case_id_filter": request.case_id,
            "citations": citations,
        })));
        callbacks.on_tool_end(
            SEARCH_TOOL_NAME,
            &format!("Retrieved {} relevant passages", hits.len()),
        );
        callbacks.on_agent_observation(
            DEMO_AGENT_NAME,
            &format!("Found {} passages to ground the answer", hits.len()),
        );

        callbacks.on_llm_start(
            MODEL_NAME,
            vec![
                json!({ "role": "system", "content": SYSTEM_PROMPT }),
                json!({ "role": "user", "content": prompt }),
            ],
        );
        self.pause(&cancel).await?;
        let answer = compose_answer(&request, &hits);
        callbacks.on_llm_end(MODEL_NAME, &answer);

        callbacks.on_thinking_end(DEMO_AGENT_NAME, "Answer is grounded in the cited filings");
        callbacks.on_agent_end(DEMO_AGENT_NAME, &answer);

        Ok(AgentOutcome::new(answer)
            .with_citations(citations)
            .with_case_filter(request.case_id))
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| word.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn compose_answer(request: &AgentRequest, hits: &[&CaseDocument]) -> String {
    let scope = match request.case_id {
        Some(case_id) => format!("case {case_id}"),
        None => "the available filings".to_owned(),
    };
    let Some(best) = hits.first() else {
        return format!("No passages in {scope} address this question.");
    };
    let sources: Vec<&str> = hits.iter().map(|doc| doc.source.as_str()).collect();
    format!(
        "Based on {} passage(s) from {scope} ({}): {}",
        hits.len(),
        sources.join(", "),
        best.text
    )
}

fn sample_documents() -> Vec<CaseDocument> {
    vec![
        CaseDocument::new(
            1,
            "complaint.pdf",
            "Plaintiff Meridian Supply alleges that Harbor Logistics breached the master \
             services agreement by failing to deliver the contracted shipments in March.",
        ),
        CaseDocument::new(
            1,
            "master_services_agreement.pdf",
            "The agreement was signed on January 14 and requires delivery within thirty days \
             of each purchase order, with liquidated damages for late delivery.",
        ),
        CaseDocument::new(
            1,
            "deposition_harbor_cfo.pdf",
            "The chief financial officer of Harbor Logistics testified that the March \
             shipments were delayed by a port closure outside the company's control.",
        ),
        CaseDocument::new(
            2,
            "lease.pdf",
            "The commercial lease runs for five years and permits early termination only \
             upon ninety days written notice from the tenant.",
        ),
        CaseDocument::new(
            2,
            "termination_notice.pdf",
            "Tenant delivered written notice of termination on June 2, citing persistent \
             HVAC failures that the landlord did not repair.",
        ),
    ]
}
