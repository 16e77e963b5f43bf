use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::{RuntimeConfig, display_db_url};
use crate::llm::ChatClient;
use crate::model::{CreateOutcome, NewResource};
use crate::oracle::ClassificationOracle;
use crate::progress::progress_channel;
use crate::resolver::ResourceResolver;
use crate::store::{BookmarkStore, SqliteBookmarkStore};
use crate::telemetry::TelemetrySink;

async fn open_store(cfg: &RuntimeConfig) -> Result<SqliteBookmarkStore> {
    let store = SqliteBookmarkStore::open(&cfg.db_url).await?;
    store.migrate().await?;
    Ok(store)
}

pub async fn run_migrate(cfg: &RuntimeConfig) -> Result<()> {
    open_store(cfg).await?;
    println!(
        "SQLite migrations applied successfully: {}",
        display_db_url(cfg)
    );
    Ok(())
}

pub async fn run_users_create(cfg: &RuntimeConfig, username: &str) -> Result<()> {
    let store = open_store(cfg).await?;
    let (user, token) = store.create_user(username).await?;
    println!("Created user '{}' (id {}).", user.username, user.id);
    println!("API token (shown once): {token}");
    Ok(())
}

pub async fn run_resources_add(
    cfg: &RuntimeConfig,
    user_id: i64,
    resource: NewResource,
) -> Result<()> {
    let store = open_store(cfg).await?;
    let url = resource.url.clone();
    match store.create_resource(user_id, resource).await? {
        CreateOutcome::Created(created) => {
            let tags = store.tags_for_resource(user_id, created.id).await?;
            println!(
                "Saved resource {} '{}' [{}]",
                created.id,
                created.title,
                tags.join(", ")
            );
        }
        CreateOutcome::AlreadyExists => {
            return Err(anyhow::anyhow!(
                "'{url}' is already bookmarked by user {user_id}"
            ));
        }
    }
    Ok(())
}

pub async fn run_search(
    cfg: &RuntimeConfig,
    user_id: i64,
    query: &str,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let query = query.trim();
    if query.is_empty() {
        return Err(anyhow::anyhow!("search query cannot be empty"));
    }

    let store: Arc<dyn BookmarkStore> = Arc::new(open_store(cfg).await?);
    let client = Arc::new(ChatClient::new(cfg).context("failed to prepare oracle client")?);
    let resolver = ResourceResolver::new(
        store.clone(),
        ClassificationOracle::new(client),
        cfg.tag_page_size,
    )
    .with_telemetry(telemetry.clone());

    let (progress_tx, mut progress_rx) = progress_channel();
    let resources = resolver.resolve(user_id, query, &progress_tx).await;

    for event in progress_rx.drain() {
        println!("[{:>3}%] {}", event.percent, event.message);
    }

    if resources.is_empty() {
        println!("No matching resources.");
        return Ok(());
    }

    println!("Results:");
    for (index, resource) in resources.iter().enumerate() {
        let tags = store.tags_for_resource(user_id, resource.id).await?;
        println!(
            "{}. {} <{}> [{}]",
            index + 1,
            resource.title,
            resource.url,
            tags.join(", ")
        );
    }
    Ok(())
}
