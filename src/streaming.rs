use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::model::ResourceCard;

pub const NO_TEXTUAL_RESPONSE: &str = "No textual response produced by the agent.";

/// One frame of the outbound event stream, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking {
        content: String,
        #[serde(default)]
        metadata: Value,
    },
    ToolCall {
        tool_name: String,
        tool_input: Value,
        status: String,
    },
    ToolResult {
        tool_name: String,
        tool_output: String,
        status: String,
    },
    ToolProgress {
        tool_name: String,
        step: String,
        message: String,
        progress: u8,
        #[serde(default)]
        data: Value,
        timestamp: f64,
    },
    Resource {
        resources: Vec<ResourceCard>,
        count: usize,
        timestamp: f64,
    },
    Response {
        content: String,
        #[serde(default)]
        metadata: Value,
    },
    Error {
        content: String,
    },
    Done,
}

impl StreamEvent {
    pub fn thinking(content: impl Into<String>, model: &str) -> Self {
        Self::Thinking {
            content: content.into(),
            metadata: json!({ "model": model }),
        }
    }

    pub fn tool_call(tool_name: impl Into<String>, tool_input: Value) -> Self {
        Self::ToolCall {
            tool_name: tool_name.into(),
            tool_input,
            status: "started".to_string(),
        }
    }

    pub fn tool_result(tool_name: impl Into<String>, tool_output: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_name: tool_name.into(),
            tool_output: tool_output.into(),
            status: "completed".to_string(),
        }
    }

    pub fn response(content: impl Into<String>) -> Self {
        Self::Response {
            content: content.into(),
            metadata: json!({ "final": true }),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolProgress { .. } => "tool_progress",
            Self::Resource { .. } => "resource",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            json!({ "type": "error", "content": format!("failed to encode event: {err}") })
                .to_string()
        })
    }

    /// Raw `text/event-stream` framing of this event.
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}
