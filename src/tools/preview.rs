use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;
use crate::oracle::StructuredPrompt;
use crate::tools::{PREVIEW_TOOL_NAME, ToolContext, required_str, tool_error};

const DRAFT_SYSTEM: &str = "You extract and summarize web pages. The user liked a page and \
wants to bookmark it. From the page content and the user's note, produce a title, a digest, \
and 3-5 concise tags.\n\
<rules>\n\
1. The content was scraped and may contain ads or recommendations; find the page's real subject.\n\
2. When the user already has tags, prefer reusing them to keep their tagging consistent.\n\
3. New tags are fine when the content has features no existing tag covers.\n\
4. Tags should be short and neither too broad nor too narrow.\n\
</rules>";

/// A generated bookmark proposal for a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceDraft {
    /// Title of the page's main content.
    pub title: String,
    /// Three to five short tags.
    pub tags: Vec<String>,
    /// Short summary of the page.
    pub digest: String,
}

/// Best-effort retrieval of a page as plain text.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String>;
}

/// Fetches pages through a reader service that returns readable text for `<base><url>`.
pub struct ReaderFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl ReaderFetcher {
    pub fn new(cfg: &RuntimeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.reader_timeout_secs))
            .build()
            .context("failed to build reader http client")?;
        Ok(Self {
            http,
            base_url: cfg.reader_base_url.clone(),
        })
    }
}

#[async_trait]
impl PageFetcher for ReaderFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, url))
            .send()
            .await
            .with_context(|| format!("failed to fetch '{url}' through reader service"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("reader service returned HTTP {status} for '{url}'"));
        }
        response
            .text()
            .await
            .with_context(|| format!("failed to read page body for '{url}'"))
    }
}

pub fn validate_page_url(raw: &str) -> Result<url::Url> {
    let parsed = url::Url::parse(raw).with_context(|| format!("'{raw}' is not a valid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(anyhow::anyhow!("'{raw}' must be an http(s) URL with a host"));
    }
    Ok(parsed)
}

pub fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() > max_chars {
        let head = content.chars().take(max_chars).collect::<String>();
        format!("{head}...")
    } else {
        content.to_string()
    }
}

fn fail(ctx: &ToolContext, message: String) -> Value {
    ctx.progress.milestone(PREVIEW_TOOL_NAME, "error", message.clone(), 0);
    tool_error(message)
}

pub async fn preview_tool_response(ctx: &ToolContext, args: &Value) -> Value {
    let url = match required_str(args, "url") {
        Ok(url) => url,
        Err(err) => return err,
    };
    let note = args
        .get("note")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim();

    if let Err(err) = validate_page_url(url) {
        return fail(ctx, format!("{err}"));
    }

    ctx.progress
        .milestone(PREVIEW_TOOL_NAME, "fetching", "Fetching page content...", 20);
    let content = match ctx.fetcher.fetch(url).await {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => return fail(ctx, format!("no content could be fetched from '{url}'")),
        Err(err) => return fail(ctx, format!("failed to fetch page content: {err:#}")),
    };
    let content = truncate_content(&content, ctx.preview_max_chars);

    ctx.progress
        .milestone(PREVIEW_TOOL_NAME, "analyzing", "Analyzing page content...", 40);
    let existing_tags = match ctx.resolver.store().list_tags(ctx.owner_id).await {
        Ok(tags) => tags.into_iter().map(|tag| tag.name).collect::<Vec<_>>(),
        Err(err) => {
            tracing::warn!(owner_id = ctx.owner_id, error = %err, "preview continues without existing tags");
            Vec::new()
        }
    };

    ctx.progress
        .milestone(PREVIEW_TOOL_NAME, "generating", "Generating resource preview...", 60);
    let prompt = StructuredPrompt::new::<ResourceDraft>(
        DRAFT_SYSTEM,
        format!(
            "<page_content>{content}</page_content>\n<user_note>{note}</user_note>\n<existing_tags>{}</existing_tags>",
            existing_tags.join(", ")
        ),
    );
    let draft = ctx.drafter.complete(&prompt).await.and_then(|value| {
        serde_json::from_value::<ResourceDraft>(value)
            .context("preview answer did not match the draft schema")
    });

    match draft {
        Ok(draft) => {
            ctx.progress
                .milestone(PREVIEW_TOOL_NAME, "completed", "Resource preview ready.", 100);
            json!({
                "success": true,
                "url": url,
                "title": draft.title,
                "tags": draft.tags,
                "digest": draft.digest,
                "message": "Preview generated; review it and ask for changes if needed."
            })
        }
        Err(err) => fail(ctx, format!("failed to generate resource preview: {err:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_urls_need_http_scheme_and_host() {
        assert!(validate_page_url("https://example.com/post").is_ok());
        assert!(validate_page_url("ftp://example.com/file").is_err());
        assert!(validate_page_url("example.com").is_err());
        assert!(validate_page_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn content_truncation_counts_characters() {
        assert_eq!(truncate_content("abcdef", 10), "abcdef");
        assert_eq!(truncate_content("abcdef", 3), "abc...");
        assert_eq!(truncate_content("héllo wörld", 5), "héllo...");
    }
}
