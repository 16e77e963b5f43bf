use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Candidate;

/// Maximum number of tags the keyword fallback may select.
pub const TAG_FALLBACK_LIMIT: usize = 3;

const TAG_SELECTION_SYSTEM: &str = "The user keeps a collection of bookmarked links. Every \
bookmark carries several tags. The user describes the kind of resource they are looking for; \
choose the most relevant tags from the given tag list.\n\
<rules>\n\
1. Choose tags that relate directly to the request.\n\
2. Choose at most 3-5 tags so results stay focused.\n\
3. If the request is vague, choose the tags most likely to match.\n\
4. If no tag is relevant, return an empty list.\n\
</rules>";

const RESOURCE_SELECTION_SYSTEM: &str = "You help the user find bookmarks in their collection. \
Choose the candidate resources that best match what the user is looking for.\n\
<rules>\n\
1. The resource title must relate to the request.\n\
2. Prefer more specific and more precise matches.\n\
3. Choose at most 5 resources.\n\
4. If no resource is relevant, return an empty list.\n\
</rules>";

/// A single structured-output request: instructions, the user turn, and the JSON schema
/// the answer must follow.
#[derive(Debug, Clone)]
pub struct StructuredPrompt {
    pub system: String,
    pub user: String,
    pub schema: Value,
}

impl StructuredPrompt {
    pub fn new<T: JsonSchema>(system: impl Into<String>, user: impl Into<String>) -> Self {
        let schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);
        Self {
            system: system.into(),
            user: user.into(),
            schema,
        }
    }
}

/// The text-classification service behind the oracle. Any error (transport, timeout,
/// unparseable answer) sends the caller down the keyword fallback.
#[async_trait]
pub trait OracleBackend: Send + Sync {
    async fn complete(&self, prompt: &StructuredPrompt) -> Result<Value>;
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TagSelectionOutput {
    /// Names of the selected tags, copied exactly from the available list.
    pub selected_tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResourceSelectionOutput {
    /// Ids of the selected candidate resources.
    pub selected_resource_ids: Vec<i64>,
}

/// Outcome of the parse step applied to every oracle answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection<T> {
    Picked(Vec<T>),
    Malformed(String),
}

pub fn parse_tag_selection(value: &Value) -> Selection<String> {
    match serde_json::from_value::<TagSelectionOutput>(value.clone()) {
        Ok(output) => Selection::Picked(output.selected_tags),
        Err(err) => Selection::Malformed(format!("tag selection did not match schema: {err}")),
    }
}

pub fn parse_resource_selection(value: &Value) -> Selection<i64> {
    match serde_json::from_value::<ResourceSelectionOutput>(value.clone()) {
        Ok(output) => Selection::Picked(output.selected_resource_ids),
        Err(err) => {
            Selection::Malformed(format!("resource selection did not match schema: {err}"))
        }
    }
}

/// Whitespace-separated, lowercased query terms used by the keyword fallback.
pub fn keyword_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn matches_any_term(text: &str, terms: &[String]) -> bool {
    let text = text.to_lowercase();
    terms.iter().any(|term| text.contains(term.as_str()))
}

pub fn fallback_tags(query: &str, options: &[String]) -> Vec<String> {
    let terms = keyword_terms(query);
    options
        .iter()
        .filter(|tag| matches_any_term(tag, &terms))
        .take(TAG_FALLBACK_LIMIT)
        .cloned()
        .collect()
}

// Only the tag stage caps its fallback.
pub fn fallback_resources(query: &str, options: &[Candidate]) -> Vec<i64> {
    let terms = keyword_terms(query);
    options
        .iter()
        .filter(|candidate| matches_any_term(&candidate.title, &terms))
        .map(|candidate| candidate.id)
        .collect()
}

fn clip_to_domain<T, F>(picked: Vec<T>, allowed: F) -> Vec<T>
where
    T: Clone + Eq + std::hash::Hash,
    F: Fn(&T) -> bool,
{
    let mut seen = HashSet::new();
    picked
        .into_iter()
        .filter(|item| allowed(item) && seen.insert(item.clone()))
        .collect()
}

/// Which side of the selection produced the result; reported to metrics and telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionSource {
    Oracle,
    Fallback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionResult<T> {
    pub selected: Vec<T>,
    pub source: SelectionSource,
}

impl<T> SelectionResult<T> {
    pub fn used_fallback(&self) -> bool {
        matches!(self.source, SelectionSource::Fallback(_))
    }
}

/// Narrows a candidate set by relevance to a query.
#[derive(Clone)]
pub struct ClassificationOracle {
    backend: Arc<dyn OracleBackend>,
}

impl ClassificationOracle {
    pub fn new(backend: Arc<dyn OracleBackend>) -> Self {
        Self { backend }
    }

    pub async fn select_tags(&self, query: &str, options: &[String]) -> SelectionResult<String> {
        if options.is_empty() {
            return SelectionResult {
                selected: Vec::new(),
                source: SelectionSource::Oracle,
            };
        }

        let prompt = StructuredPrompt::new::<TagSelectionOutput>(
            TAG_SELECTION_SYSTEM,
            format!(
                "<request>{query}</request>\n<available_tags>{}</available_tags>\nSelect the relevant tags.",
                serde_json::to_string(options).unwrap_or_default()
            ),
        );

        let parsed = match self.backend.complete(&prompt).await {
            Ok(value) => parse_tag_selection(&value),
            Err(err) => Selection::Malformed(format!("{err:#}")),
        };

        match parsed {
            Selection::Picked(tags) => {
                let selected = clip_to_domain(tags, |tag| options.contains(tag));
                tracing::debug!(?selected, "oracle selected tags");
                SelectionResult {
                    selected,
                    source: SelectionSource::Oracle,
                }
            }
            Selection::Malformed(reason) => {
                tracing::warn!(reason = %reason, "tag selection failed, using keyword fallback");
                SelectionResult {
                    selected: fallback_tags(query, options),
                    source: SelectionSource::Fallback(reason),
                }
            }
        }
    }

    pub async fn select_resources(
        &self,
        query: &str,
        options: &[Candidate],
    ) -> SelectionResult<i64> {
        if options.is_empty() {
            return SelectionResult {
                selected: Vec::new(),
                source: SelectionSource::Oracle,
            };
        }

        let listing = options
            .iter()
            .map(|candidate| format!("ID: {}, Title: {}", candidate.id, candidate.title))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = StructuredPrompt::new::<ResourceSelectionOutput>(
            RESOURCE_SELECTION_SYSTEM,
            format!(
                "<request>{query}</request>\n<candidates>\n{listing}\n</candidates>\nSelect the ids of the best matching resources."
            ),
        );

        let parsed = match self.backend.complete(&prompt).await {
            Ok(value) => parse_resource_selection(&value),
            Err(err) => Selection::Malformed(format!("{err:#}")),
        };

        match parsed {
            Selection::Picked(ids) => {
                let selected =
                    clip_to_domain(ids, |id| options.iter().any(|candidate| candidate.id == *id));
                tracing::debug!(?selected, "oracle selected resources");
                SelectionResult {
                    selected,
                    source: SelectionSource::Oracle,
                }
            }
            Selection::Malformed(reason) => {
                tracing::warn!(reason = %reason, "resource selection failed, using keyword fallback");
                SelectionResult {
                    selected: fallback_resources(query, options),
                    source: SelectionSource::Fallback(reason),
                }
            }
        }
    }
}
