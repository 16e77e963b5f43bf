use serde_json::{Value, json};

use crate::model::{CreateOutcome, NewResource};
use crate::tools::{ToolContext, required_str, tool_error};

pub const DUPLICATE_URL_ERROR: &str = "this link is already bookmarked";

pub async fn create_tool_response(ctx: &ToolContext, args: &Value) -> Value {
    let (url, title) = match (required_str(args, "url"), required_str(args, "title")) {
        (Ok(url), Ok(title)) => (url.to_string(), title.to_string()),
        (Err(err), _) | (_, Err(err)) => return err,
    };
    let digest = args
        .get("digest")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let tags = args
        .get("tags")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let draft = NewResource {
        url: url.clone(),
        title: title.clone(),
        digest,
        tags: tags.clone(),
    };

    match ctx.resolver.store().create_resource(ctx.owner_id, draft).await {
        Ok(CreateOutcome::Created(resource)) => json!({
            "success": true,
            "resource_id": resource.id,
            "message": format!("Saved '{title}' to your bookmarks."),
            "url": url,
            "tags": tags
        }),
        Ok(CreateOutcome::AlreadyExists) => tool_error(DUPLICATE_URL_ERROR),
        Err(err) => {
            tracing::warn!(owner_id = ctx.owner_id, error = %format!("{err:#}"), "create_resource failed");
            tool_error(format!("failed to save resource: {err}"))
        }
    }
}
