//! OpenAI-compatible chat completions client.
//!
//! Serves two callers: the classification oracle and the resource preview tool use
//! [`OracleBackend::complete`] for one-shot JSON answers, and the agent uses
//! [`AgentModel::stream_turn`] for token streaming with tool calls.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::AgentModel;
use crate::config::RuntimeConfig;
use crate::oracle::{OracleBackend, StructuredPrompt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    pub fn assistant_tool_calls(content: String, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content).filter(|text| !text.is_empty()),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// One streamed increment of an assistant turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatDelta {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<String>,
}

/// Partial tool call; fragments sharing an `index` concatenate into one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChunkToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChunkToolCall {
    #[serde(default)]
    index: Option<u32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<ChunkFunction>,
}

#[derive(Debug, Deserialize)]
struct ChunkFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
}

impl ChatClient {
    pub fn new(cfg: &RuntimeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.oracle_timeout_secs))
            .build()
            .context("failed to build AI endpoint http client")?;
        Ok(Self {
            http,
            base_url: cfg.ai_base_url.trim_end_matches('/').to_string(),
            model: cfg.ai_model.clone(),
            api_key: cfg.ai_api_key(),
            api_key_env: cfg.ai_api_key_env.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "AI API key is not configured; set the {} environment variable",
                self.api_key_env
            )
        })
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(self.api_key()?)
            .json(body)
            .send()
            .await
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "chat completion returned HTTP {}: {}",
                status,
                detail.chars().take(300).collect::<String>()
            ));
        }
        Ok(response)
    }
}

#[async_trait]
impl OracleBackend for ChatClient {
    async fn complete(&self, prompt: &StructuredPrompt) -> Result<Value> {
        let system = format!(
            "{}\n\nRespond with a single JSON object matching this JSON schema, and nothing else:\n{}",
            prompt.system, prompt.schema
        );
        let body = json!({
            "model": self.model,
            "stream": false,
            "response_format": { "type": "json_object" },
            "messages": [ChatMessage::system(system), ChatMessage::user(prompt.user.clone())],
        });

        let response = self
            .post(&body)
            .await?
            .json::<CompletionResponse>()
            .await
            .context("failed to decode chat completion response")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat completion returned no message content"))?;

        parse_json_content(&content)
    }
}

#[async_trait]
impl AgentModel for ChatClient {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<BoxStream<'static, Result<ChatDelta>>> {
        let mut body = json!({
            "model": self.model,
            "stream": true,
            "messages": messages,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }

        let response = self.post(&body).await?;
        Ok(parse_sse_bytes(response.bytes_stream()).boxed())
    }
}

/// Parses model output as JSON, tolerating a surrounding markdown code fence.
pub fn parse_json_content(content: &str) -> Result<Value> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();
    serde_json::from_str::<Value>(unfenced)
        .with_context(|| format!("chat completion content is not valid JSON: {unfenced:.120}"))
}

#[derive(Debug)]
pub enum SseFrame {
    Delta(ChatDelta),
    Done,
}

/// Parses one SSE event (possibly several `data:` lines). Comments and keep-alives yield `None`.
pub fn parse_sse_event(event: &str) -> Result<Option<SseFrame>> {
    let mut data = String::new();
    for line in event.lines() {
        if let Some(payload) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        {
            let payload = payload.trim();
            if payload == "[DONE]" {
                return Ok(Some(SseFrame::Done));
            }
            data.push_str(payload);
        }
    }

    if data.is_empty() {
        return Ok(None);
    }

    let chunk = serde_json::from_str::<ChunkResponse>(&data)
        .with_context(|| format!("failed to parse chat completion stream chunk: {data:.120}"))?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };

    Ok(Some(SseFrame::Delta(ChatDelta {
        content: choice.delta.content.filter(|text| !text.is_empty()),
        tool_calls: choice
            .delta
            .tool_calls
            .into_iter()
            .map(|call| ToolCallFragment {
                index: call.index.unwrap_or(0),
                id: call.id,
                name: call.function.as_ref().and_then(|f| f.name.clone()),
                arguments: call.function.and_then(|f| f.arguments),
            })
            .collect(),
        finish_reason: choice.finish_reason,
    })))
}

/// Splits the next complete SSE frame off the front of `buffer`.
fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer.windows(2).position(|pair| pair == b"\n\n")?;
    let frame = buffer[..end].to_vec();
    buffer.drain(..end + 2);
    Some(frame)
}

fn decode_frame(frame: &[u8]) -> Result<Option<SseFrame>> {
    let text = std::str::from_utf8(frame).context("chat completion stream frame is not valid UTF-8")?;
    parse_sse_event(text.trim())
}

/// Turns a raw byte stream into chat deltas. Bytes are buffered until a whole frame is
/// available, so multi-byte characters split across chunks decode intact. `\r` is
/// dropped on arrival, which makes CRLF-delimited frames split as they come in.
pub fn parse_sse_bytes<S, B, E>(chunks: S) -> impl futures::Stream<Item = Result<ChatDelta>> + Send + 'static
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    stream::unfold(
        (chunks.boxed(), Vec::<u8>::new(), false),
        |(mut chunks, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(frame) = take_frame(&mut buffer) {
                    match decode_frame(&frame) {
                        Ok(Some(SseFrame::Delta(delta))) => {
                            return Some((Ok(delta), (chunks, buffer, false)));
                        }
                        Ok(Some(SseFrame::Done)) => return None,
                        Ok(None) => continue,
                        Err(err) => return Some((Err(err), (chunks, buffer, true))),
                    }
                }

                match chunks.next().await {
                    Some(Ok(chunk)) => buffer.extend(
                        chunk.as_ref().iter().copied().filter(|byte| *byte != b'\r'),
                    ),
                    Some(Err(err)) => {
                        return Some((
                            Err(anyhow::anyhow!("chat completion stream read error: {err}")),
                            (chunks, buffer, true),
                        ));
                    }
                    None => {
                        let rest = std::mem::take(&mut buffer);
                        return match decode_frame(&rest) {
                            Ok(Some(SseFrame::Delta(delta))) => {
                                Some((Ok(delta), (chunks, buffer, true)))
                            }
                            Ok(_) => None,
                            Err(err) => Some((Err(err), (chunks, buffer, true))),
                        };
                    }
                }
            }
        },
    )
}
