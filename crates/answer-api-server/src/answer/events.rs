use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationInfo {
    pub citation_num: usize,
    pub document_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStopReason {
    Finished,
    Cancelled,
}

/// Everything the answer engine can emit, in stream order. Tool events for
/// a tool always precede the first answer piece produced from its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnswerEvent {
    AnswerPiece(String),
    Citation(CitationInfo),
    ToolKickoff {
        tool_name: String,
        tool_args: serde_json::Value,
    },
    ToolResponse {
        tool_name: String,
        response: serde_json::Value,
    },
    StreamStop(StreamStopReason),
    StreamingError(String),
}
