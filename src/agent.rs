use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::{Value, json};

use crate::llm::{ChatDelta, ChatMessage, FunctionCall, ToolCallFragment, ToolCallRequest};
use crate::multiplex::EventSource;
use crate::streaming::{NO_TEXTUAL_RESPONSE, StreamEvent};
use crate::tools::Toolbox;

pub const AGENT_SYSTEM_PROMPT: &str = "You are a bookmark assistant. You help the user search \
and manage the resources they have saved.\n\
\n\
Available tools:\n\
- search_resources: search the user's saved resources\n\
- preview_resource: build a preview (title, tags, digest) for a URL\n\
- create_resource: save a resource to the user's collection\n\
\n\
## Saving a resource\n\
1. When the user shares a URL (optionally with a note), call `preview_resource`.\n\
2. Show the generated title, tags and digest and ask whether they look right.\n\
3. If the user asks for changes, edit the preview yourself without calling the tool again.\n\
4. Call `create_resource` only after the user explicitly confirms.\n\
\n\
## Notes\n\
- Present previews in a clear layout: title, tags, digest.\n\
- The user may revise the preview as many times as they like.\n\
- When the user only wants to find something they saved, use `search_resources`.\n\
\n\
Pick the right tool for each request and pass arguments in the documented format.";

/// Streaming chat model with tool calling.
#[async_trait]
pub trait AgentModel: Send + Sync {
    fn model_name(&self) -> String;

    async fn stream_turn(
        &self,
        messages: &[ChatMessage],
        tools: &[Value],
    ) -> Result<BoxStream<'static, Result<ChatDelta>>>;
}

/// Builds the prior conversation from `(role, content)` pairs; only user and assistant
/// turns are kept.
pub fn conversation_history<'a>(
    turns: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Vec<ChatMessage> {
    turns
        .into_iter()
        .filter_map(|(role, content)| match role {
            "user" => Some(ChatMessage::user(content)),
            "assistant" => Some(ChatMessage::assistant(content)),
            _ => None,
        })
        .collect()
}

/// Joins streamed tool-call fragments by index into complete calls, in index order.
pub fn accumulate_tool_calls(
    fragments: impl IntoIterator<Item = ToolCallFragment>,
) -> Vec<ToolCallRequest> {
    let mut calls: BTreeMap<u32, ToolCallRequest> = BTreeMap::new();
    for fragment in fragments {
        let call = calls.entry(fragment.index).or_insert_with(|| ToolCallRequest {
            id: String::new(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: String::new(),
                arguments: String::new(),
            },
        });
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = fragment.name {
            call.function.name.push_str(&name);
        }
        if let Some(arguments) = fragment.arguments {
            call.function.arguments.push_str(&arguments);
        }
    }

    calls
        .into_iter()
        .filter(|(_, call)| !call.function.name.is_empty())
        .map(|(index, mut call)| {
            if call.id.is_empty() {
                call.id = format!("call_{index}");
            }
            call
        })
        .collect()
}

fn parse_tool_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str::<Value>(raw).map_err(|err| format!("invalid tool arguments: {err}"))
}

/// Runs the agent loop and yields its trace: content tokens as `thinking`, each tool
/// invocation as `tool_call` then `tool_result`, and the final answer as `response`.
///
/// After `max_iterations` rounds of tool calls, one last turn is run without tools so the
/// model has to produce an answer.
pub fn run_agent(
    model: Arc<dyn AgentModel>,
    toolbox: Arc<Toolbox>,
    history: Vec<ChatMessage>,
    input: String,
    max_iterations: u32,
) -> EventSource {
    async_stream::stream! {
        let model_name = model.model_name();
        let definitions = toolbox.definitions();
        let max_iterations = max_iterations.max(1);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(AGENT_SYSTEM_PROMPT));
        messages.extend(history);
        messages.push(ChatMessage::user(input));

        let mut iteration = 0u32;
        loop {
            let tools: &[Value] = if iteration < max_iterations { &definitions } else { &[] };
            let mut turn = match model.stream_turn(&messages, tools).await {
                Ok(turn) => turn,
                Err(err) => {
                    yield Err::<StreamEvent, anyhow::Error>(err.context("agent model request failed"));
                    return;
                }
            };

            let mut content = String::new();
            let mut fragments = Vec::new();
            while let Some(delta) = turn.next().await {
                let delta = match delta {
                    Ok(delta) => delta,
                    Err(err) => {
                        yield Err(err.context("agent model stream failed"));
                        return;
                    }
                };
                if let Some(token) = delta.content {
                    content.push_str(&token);
                    yield Ok(StreamEvent::thinking(token, &model_name));
                }
                fragments.extend(delta.tool_calls);
            }

            let calls = accumulate_tool_calls(fragments);
            if calls.is_empty() || tools.is_empty() {
                let answer = content.trim();
                let answer = if answer.is_empty() { NO_TEXTUAL_RESPONSE } else { answer };
                yield Ok(StreamEvent::response(answer));
                return;
            }

            tracing::debug!(iteration, calls = calls.len(), "agent requested tools");
            messages.push(ChatMessage::assistant_tool_calls(content, calls.clone()));
            for call in calls {
                let name = call.function.name.clone();
                let output = match parse_tool_arguments(&call.function.arguments) {
                    Ok(arguments) => {
                        yield Ok(StreamEvent::tool_call(name.clone(), arguments.clone()));
                        toolbox.dispatch(&name, arguments).await
                    }
                    Err(message) => {
                        yield Ok(StreamEvent::tool_call(
                            name.clone(),
                            Value::String(call.function.arguments.clone()),
                        ));
                        json!({ "success": false, "error": message }).to_string()
                    }
                };
                yield Ok(StreamEvent::tool_result(name, output.clone()));
                messages.push(ChatMessage::tool(call.id, output));
            }
            iteration += 1;
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_join_by_index() {
        let calls = accumulate_tool_calls(vec![
            ToolCallFragment {
                index: 1,
                id: Some("b".to_string()),
                name: Some("create_resource".to_string()),
                arguments: Some("{\"url\":".to_string()),
            },
            ToolCallFragment {
                index: 0,
                id: None,
                name: Some("search_resources".to_string()),
                arguments: Some("{}".to_string()),
            },
            ToolCallFragment {
                index: 1,
                id: None,
                name: None,
                arguments: Some("\"https://a.dev\"}".to_string()),
            },
        ]);

        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].function.name, "search_resources");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].id, "b");
        assert_eq!(calls[1].function.arguments, "{\"url\":\"https://a.dev\"}");
    }

    #[test]
    fn history_keeps_only_conversation_roles() {
        let history = conversation_history(vec![
            ("system", "ignored"),
            ("user", "hi"),
            ("assistant", "hello"),
            ("tool", "ignored"),
        ]);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "assistant");
    }
}
