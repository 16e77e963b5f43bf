use serde_json::{Value, json};

use crate::model::{Resource, ResourceCard};
use crate::tools::{SEARCH_TOOL_NAME, ToolContext, required_str};

const DESCRIPTION_CHARS: usize = 100;

pub fn truncate_description(digest: &str) -> String {
    if digest.chars().count() > DESCRIPTION_CHARS {
        let head = digest.chars().take(DESCRIPTION_CHARS).collect::<String>();
        format!("{head}...")
    } else {
        digest.to_string()
    }
}

fn empty_result_message(query: &str, outcome: &str) -> String {
    match outcome {
        "no_tags" => "The user has not saved any resources yet.".to_string(),
        "no_matching_tags" => format!("No tags relate to '{query}'."),
        "no_candidates" => format!("No saved resources sit under the tags matching '{query}'."),
        "failed" => format!("Searching for '{query}' failed; no results are available."),
        _ => format!("No resources related to '{query}' were found."),
    }
}

async fn resource_cards(ctx: &ToolContext, resources: &[Resource]) -> Vec<ResourceCard> {
    let store = ctx.resolver.store();
    let mut cards = Vec::with_capacity(resources.len());
    for resource in resources {
        let tags = match store.tags_for_resource(ctx.owner_id, resource.id).await {
            Ok(tags) => tags,
            Err(err) => {
                tracing::warn!(resource_id = resource.id, error = %err, "failed to load tags for resource card");
                Vec::new()
            }
        };
        cards.push(ResourceCard::from_resource(resource, tags));
    }
    cards
}

pub async fn search_tool_response(ctx: &ToolContext, args: &Value) -> Value {
    let query = match required_str(args, "query") {
        Ok(query) => query,
        Err(err) => return err,
    };
    let limit = args
        .get("limit")
        .and_then(Value::as_u64)
        .map(|value| value as usize)
        .unwrap_or(ctx.search_limit)
        .max(1);

    let (resources, outcome) = ctx
        .resolver
        .resolve_labelled(ctx.owner_id, query, &ctx.progress)
        .await;

    if resources.is_empty() {
        return json!({
            "success": true,
            "query": query,
            "count": 0,
            "total": 0,
            "results": [],
            "message": empty_result_message(query, outcome)
        });
    }

    let shown = &resources[..resources.len().min(limit)];
    let cards = resource_cards(ctx, shown).await;
    ctx.progress.resources(SEARCH_TOOL_NAME, &cards);

    let results = shown
        .iter()
        .enumerate()
        .map(|(index, resource)| {
            json!({
                "index": index + 1,
                "title": resource.title,
                "url": resource.url,
                "description": truncate_description(&resource.digest)
            })
        })
        .collect::<Vec<_>>();

    json!({
        "success": true,
        "query": query,
        "count": resources.len(),
        "total": resources.len(),
        "results": results,
        "message": format!(
            "Found {} resources related to '{}'; they are shown as cards.",
            resources.len(),
            query
        )
    })
}
