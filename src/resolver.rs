//! Two-stage resource resolution: the oracle first narrows the user's tags, then the
//! resources found under those tags.
//!
//! A run is a strictly sequential pipeline with early exits. Anything unexpected inside it
//! degrades to an empty result; [`ResourceResolver::resolve`] never returns an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;

use crate::model::{Candidate, Resource};
use crate::oracle::{ClassificationOracle, SelectionResult, SelectionSource};
use crate::progress::ProgressSender;
use crate::store::BookmarkStore;
use crate::telemetry::{TelemetrySink, round_metric};

pub const SEARCH_TOOL: &str = "search_resources";

#[derive(Debug, Default)]
pub struct ResolverMetrics {
    runs: AtomicU64,
    cache_misses: AtomicU64,
    oracle_fallbacks: AtomicU64,
    swallowed_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolverMetricsSnapshot {
    pub runs: u64,
    pub cache_misses: u64,
    pub oracle_fallbacks: u64,
    pub swallowed_failures: u64,
}

impl ResolverMetrics {
    pub fn snapshot(&self) -> ResolverMetricsSnapshot {
        ResolverMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            oracle_fallbacks: self.oracle_fallbacks.load(Ordering::Relaxed),
            swallowed_failures: self.swallowed_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverOutcome {
    NoTags,
    NoMatchingTags,
    NoCandidates,
    NoMatchingResources,
    Found(Vec<Resource>),
}

impl ResolverOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoTags => "no_tags",
            Self::NoMatchingTags => "no_matching_tags",
            Self::NoCandidates => "no_candidates",
            Self::NoMatchingResources => "no_matching_resources",
            Self::Found(_) => "found",
        }
    }

    pub fn into_resources(self) -> Vec<Resource> {
        match self {
            Self::Found(resources) => resources,
            _ => Vec::new(),
        }
    }
}

/// Candidates gathered during tag expansion plus the resolution cache backing them.
/// Both are keyed by resource id and stay the same size.
#[derive(Debug, Default)]
pub struct CandidateSet {
    candidates: Vec<Candidate>,
    cache: HashMap<i64, Resource>,
}

impl CandidateSet {
    /// Returns false when the id is already present.
    pub fn insert(&mut self, resource: Resource) -> bool {
        if self.cache.contains_key(&resource.id) {
            return false;
        }
        self.candidates.push(Candidate {
            id: resource.id,
            title: resource.title.clone(),
        });
        self.cache.insert(resource.id, resource);
        true
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn cached(&self, id: i64) -> Option<&Resource> {
        self.cache.get(&id)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}

#[derive(Clone)]
pub struct ResourceResolver {
    store: Arc<dyn BookmarkStore>,
    oracle: ClassificationOracle,
    page_size: u32,
    metrics: Arc<ResolverMetrics>,
    telemetry: TelemetrySink,
}

impl ResourceResolver {
    pub fn new(store: Arc<dyn BookmarkStore>, oracle: ClassificationOracle, page_size: u32) -> Self {
        Self {
            store,
            oracle,
            page_size: page_size.max(1),
            metrics: Arc::new(ResolverMetrics::default()),
            telemetry: TelemetrySink::disabled(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ResolverMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn metrics(&self) -> Arc<ResolverMetrics> {
        self.metrics.clone()
    }

    pub fn store(&self) -> Arc<dyn BookmarkStore> {
        self.store.clone()
    }

    /// Runs the pipeline and returns the selected resources, or an empty list on any
    /// early exit or internal failure.
    pub async fn resolve(
        &self,
        owner_id: i64,
        query: &str,
        progress: &ProgressSender,
    ) -> Vec<Resource> {
        self.resolve_labelled(owner_id, query, progress).await.0
    }

    /// Like [`Self::resolve`], also returning the outcome label (`failed` for swallowed
    /// errors) so callers can explain an empty result.
    pub async fn resolve_labelled(
        &self,
        owner_id: i64,
        query: &str,
        progress: &ProgressSender,
    ) -> (Vec<Resource>, &'static str) {
        let started_at = Instant::now();
        self.metrics.runs.fetch_add(1, Ordering::Relaxed);

        let (label, resources) = match self.resolve_outcome(owner_id, query, progress).await {
            Ok(outcome) => (outcome.label(), outcome.into_resources()),
            Err(err) => {
                self.metrics
                    .swallowed_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(owner_id, error = %format!("{err:#}"), "resource resolution failed, returning no results");
                ("failed", Vec::new())
            }
        };

        self.telemetry.emit(
            "resolver.completed",
            json!({
                "outcome": label,
                "results": resources.len(),
                "latency_ms": round_metric(started_at.elapsed().as_secs_f64() * 1000.0)
            }),
        );
        (resources, label)
    }

    pub async fn resolve_outcome(
        &self,
        owner_id: i64,
        query: &str,
        progress: &ProgressSender,
    ) -> Result<ResolverOutcome> {
        progress.milestone(SEARCH_TOOL, "analyzing", "Analyzing your search request...", 10);

        let tags = self
            .store
            .list_tags(owner_id)
            .await
            .context("failed to load tags for resolution")?;
        if tags.is_empty() {
            progress.warning(
                SEARCH_TOOL,
                "no_tags",
                "You have no tags yet. Save a few bookmarks first.",
            );
            return Ok(ResolverOutcome::NoTags);
        }

        progress.milestone(SEARCH_TOOL, "intent", "Working out what you are looking for...", 20);
        let tag_names = tags.into_iter().map(|tag| tag.name).collect::<Vec<_>>();
        let selected_tags = self.oracle.select_tags(query, &tag_names).await;
        self.record_selection("tags", &selected_tags);
        if selected_tags.selected.is_empty() {
            progress.warning(
                SEARCH_TOOL,
                "no_matching_tags",
                "No tags relate to your search. Try different keywords.",
            );
            return Ok(ResolverOutcome::NoMatchingTags);
        }
        tracing::info!(owner_id, tags = ?selected_tags.selected, "tags selected");
        progress.milestone(
            SEARCH_TOOL,
            "tags",
            format!("Matched tags: {}", selected_tags.selected.join(", ")),
            30,
        );

        progress.milestone(SEARCH_TOOL, "searching", "Searching related resources...", 40);
        let candidates = self.expand_tags(owner_id, &selected_tags.selected).await;
        if candidates.is_empty() {
            progress.warning(
                SEARCH_TOOL,
                "no_candidates",
                "No resources were found under the matched tags.",
            );
            return Ok(ResolverOutcome::NoCandidates);
        }
        tracing::info!(owner_id, candidates = candidates.len(), "tag expansion finished");
        progress.milestone(
            SEARCH_TOOL,
            "candidates",
            format!(
                "Found {} candidate resources, picking the best matches...",
                candidates.len()
            ),
            60,
        );

        let selected_ids = self
            .oracle
            .select_resources(query, candidates.candidates())
            .await;
        self.record_selection("resources", &selected_ids);
        if selected_ids.selected.is_empty() {
            progress.warning(
                SEARCH_TOOL,
                "no_matching_resources",
                "None of the candidate resources match your search.",
            );
            return Ok(ResolverOutcome::NoMatchingResources);
        }
        progress.milestone(
            SEARCH_TOOL,
            "selecting",
            format!("Selected {} matching resources", selected_ids.selected.len()),
            80,
        );

        let resources = self
            .resolve_selected(owner_id, &selected_ids.selected, &candidates)
            .await?;
        if !resources.is_empty() {
            progress.milestone(
                SEARCH_TOOL,
                "completed",
                format!("Search complete: {} matching resources", resources.len()),
                100,
            );
        }
        Ok(ResolverOutcome::Found(resources))
    }

    /// Loads one page of resources per tag into a deduplicated candidate set. A failing
    /// tag is logged and skipped.
    pub async fn expand_tags(&self, owner_id: i64, tag_names: &[String]) -> CandidateSet {
        let mut set = CandidateSet::default();
        for tag_name in tag_names {
            match self
                .store
                .list_resources_by_tag(owner_id, tag_name, 1, self.page_size)
                .await
            {
                Ok((resources, total)) => {
                    tracing::debug!(tag = %tag_name, fetched = resources.len(), total, "expanded tag");
                    for resource in resources {
                        set.insert(resource);
                    }
                }
                Err(err) => {
                    tracing::warn!(tag = %tag_name, error = %format!("{err:#}"), "skipping tag after fetch failure");
                }
            }
        }
        set
    }

    /// Maps selected ids back to resources, preferring the resolution cache.
    pub async fn resolve_selected(
        &self,
        owner_id: i64,
        ids: &[i64],
        candidates: &CandidateSet,
    ) -> Result<Vec<Resource>> {
        let mut resolved = Vec::with_capacity(ids.len());
        for &id in ids {
            let resource = match candidates.cached(id) {
                Some(resource) => Some(resource.clone()),
                None => {
                    self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                    self.telemetry
                        .emit("resolver.cache_miss", json!({ "resource_id": id }));
                    tracing::warn!(resource_id = id, "resolution cache miss, loading from store");
                    self.store
                        .get_resource(owner_id, id)
                        .await
                        .with_context(|| format!("failed to load resource {id} after cache miss"))?
                }
            };

            let Some(resource) = resource else {
                tracing::warn!(resource_id = id, "selected resource no longer exists");
                continue;
            };
            if resource.owner_id != owner_id {
                anyhow::bail!(
                    "resource {} belongs to user {} but was resolved for user {}",
                    resource.id,
                    resource.owner_id,
                    owner_id
                );
            }
            resolved.push(resource);
        }
        Ok(resolved)
    }

    fn record_selection<T>(&self, stage: &str, selection: &SelectionResult<T>) {
        if let SelectionSource::Fallback(reason) = &selection.source {
            self.metrics.oracle_fallbacks.fetch_add(1, Ordering::Relaxed);
            self.telemetry.emit(
                "oracle.fallback",
                json!({ "stage": stage, "reason": reason }),
            );
        }
    }
}
