pub mod create;
pub mod preview;
pub mod search;

use std::sync::Arc;

use serde_json::{Value, json};

use crate::oracle::OracleBackend;
use crate::progress::ProgressSender;
use crate::resolver::{ResourceResolver, SEARCH_TOOL};

pub use preview::{PageFetcher, ReaderFetcher};

pub const SEARCH_TOOL_NAME: &str = SEARCH_TOOL;
pub const PREVIEW_TOOL_NAME: &str = "preview_resource";
pub const CREATE_TOOL_NAME: &str = "create_resource";

/// Everything a tool invocation may touch, scoped to one authenticated user and one
/// request's progress channel.
#[derive(Clone)]
pub struct ToolContext {
    pub owner_id: i64,
    pub resolver: ResourceResolver,
    pub drafter: Arc<dyn OracleBackend>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub progress: ProgressSender,
    pub search_limit: usize,
    pub preview_max_chars: usize,
}

pub struct Toolbox {
    ctx: ToolContext,
}

impl Toolbox {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Function-calling definitions advertised to the agent model.
    pub fn definitions(&self) -> Vec<Value> {
        vec![
            function_definition(
                SEARCH_TOOL_NAME,
                "Search the user's saved resources. Use it when the user wants to find \
                 resources they bookmarked earlier.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "What the user is looking for" },
                        "limit": { "type": "integer", "description": "Maximum number of results", "default": self.ctx.search_limit }
                    },
                    "required": ["query"]
                }),
            ),
            function_definition(
                PREVIEW_TOOL_NAME,
                "Build a preview (title, tags, digest) for a web page the user wants to save.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string", "description": "Address of the page" },
                        "note": { "type": "string", "description": "Optional note from the user", "default": "" }
                    },
                    "required": ["url"]
                }),
            ),
            function_definition(
                CREATE_TOOL_NAME,
                "Save a resource to the user's collection. Requires url, title, tags and digest.",
                json!({
                    "type": "object",
                    "properties": {
                        "url": { "type": "string" },
                        "title": { "type": "string" },
                        "tags": { "type": "array", "items": { "type": "string" } },
                        "digest": { "type": "string" }
                    },
                    "required": ["url", "title", "tags", "digest"]
                }),
            ),
        ]
    }

    /// Runs one tool and returns its JSON payload as a string. Never fails.
    pub async fn dispatch(&self, name: &str, args: Value) -> String {
        let response = match name {
            SEARCH_TOOL_NAME => search::search_tool_response(&self.ctx, &args).await,
            PREVIEW_TOOL_NAME => preview::preview_tool_response(&self.ctx, &args).await,
            CREATE_TOOL_NAME => create::create_tool_response(&self.ctx, &args).await,
            other => tool_error(format!("unknown tool '{other}'")),
        };
        response.to_string()
    }
}

fn function_definition(name: &str, description: &str, parameters: Value) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters
        }
    })
}

pub fn tool_error(message: impl Into<String>) -> Value {
    json!({ "success": false, "error": message.into() })
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, Value> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| tool_error(format!("'{key}' is required")))
}
