//! Inbound client messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::CaseId;

/// Default upper bound on query length, in characters.
pub const DEFAULT_MAX_QUERY_CHARS: usize = 4_000;

/// A validated query request: `{ query, case_id?, stream_thinking? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<CaseId>,
    #[serde(default = "default_stream_thinking")]
    pub stream_thinking: bool,
}

fn default_stream_thinking() -> bool {
    true
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            case_id: None,
            stream_thinking: true,
        }
    }

    pub fn with_case_id(mut self, case_id: CaseId) -> Self {
        self.case_id = Some(case_id);
        self
    }

    pub fn with_stream_thinking(mut self, stream_thinking: bool) -> Self {
        self.stream_thinking = stream_thinking;
        self
    }

    /// Decode and validate one inbound text frame.
    ///
    /// `null` for an optional field is treated as absent. `case_id` must be a
    /// positive integer; `stream_thinking` must be a boolean.
    pub fn parse(text: &str, max_query_chars: usize) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
        let Value::Object(object) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let query = match object.get("query") {
            None | Some(Value::Null) => return Err(ProtocolError::MissingField("query")),
            Some(Value::String(query)) => query,
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "query",
                    expected: "a string",
                });
            }
        };
        if query.trim().is_empty() {
            return Err(ProtocolError::EmptyQuery);
        }
        if query.chars().count() > max_query_chars {
            return Err(ProtocolError::QueryTooLong {
                max: max_query_chars,
            });
        }

        let case_id = match object.get("case_id") {
            None | Some(Value::Null) => None,
            Some(value) => match value.as_u64() {
                Some(id) if id > 0 => Some(id),
                _ => {
                    return Err(ProtocolError::InvalidField {
                        field: "case_id",
                        expected: "a positive integer",
                    });
                }
            },
        };

        let stream_thinking = match object.get("stream_thinking") {
            None | Some(Value::Null) => true,
            Some(Value::Bool(flag)) => *flag,
            Some(_) => {
                return Err(ProtocolError::InvalidField {
                    field: "stream_thinking",
                    expected: "a boolean",
                });
            }
        };

        Ok(Self {
            query: query.clone(),
            case_id,
            stream_thinking,
        })
    }
}
