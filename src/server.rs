use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::{AgentModel, conversation_history, run_agent};
use crate::config::RuntimeConfig;
use crate::llm::ChatClient;
use crate::model::{ResourceCard, User};
use crate::multiplex::merge_sources;
use crate::oracle::{ClassificationOracle, OracleBackend};
use crate::progress::{ProgressSender, progress_channel};
use crate::resolver::{ResolverMetrics, ResolverMetricsSnapshot, ResourceResolver};
use crate::store::{BookmarkStore, SqliteBookmarkStore};
use crate::streaming::StreamEvent;
use crate::telemetry::{TelemetrySink, round_metric};
use crate::tools::{PageFetcher, ReaderFetcher, ToolContext, Toolbox};

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub store: Arc<dyn BookmarkStore>,
    pub oracle_backend: Arc<dyn OracleBackend>,
    pub agent_model: Arc<dyn AgentModel>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub metrics: Arc<ResolverMetrics>,
    pub telemetry: TelemetrySink,
}

impl ServerState {
    pub fn resolver(&self) -> ResourceResolver {
        ResourceResolver::new(
            self.store.clone(),
            ClassificationOracle::new(self.oracle_backend.clone()),
            self.cfg.tag_page_size,
        )
        .with_metrics(self.metrics.clone())
        .with_telemetry(self.telemetry.clone())
    }

    pub fn tool_context(&self, owner_id: i64, progress: ProgressSender) -> ToolContext {
        ToolContext {
            owner_id,
            resolver: self.resolver(),
            drafter: self.oracle_backend.clone(),
            fetcher: self.fetcher.clone(),
            progress,
            search_limit: self.cfg.search_result_limit,
            preview_max_chars: self.cfg.preview_max_chars,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub app_name: String,
    pub profile: String,
    pub resolver: ResolverMetricsSnapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentChatRequest {
    #[serde(default)]
    pub messages: Vec<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub count: usize,
    pub resources: Vec<ResourceCard>,
    pub progress: Vec<String>,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn authenticate(state: &ServerState, headers: &HeaderMap) -> Result<User, ApiError> {
    let Some(token) = bearer_token(headers) else {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    };

    match state.store.find_user_by_token(token).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        )),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "token lookup failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to verify credentials",
            ))
        }
    }
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        app_name: state.cfg.app_name.clone(),
        profile: state.cfg.profile.clone(),
        resolver: state.metrics.snapshot(),
    })
}

/// Merged agent trace and progress events for one chat request, always ending with a
/// single `done`.
pub fn agent_event_stream(
    state: &ServerState,
    owner_id: i64,
    messages: Vec<IncomingMessage>,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    let (progress_tx, progress_rx) = progress_channel();
    let toolbox = Arc::new(Toolbox::new(state.tool_context(owner_id, progress_tx)));

    let (input, prior) = match messages.split_last() {
        Some((last, prior)) => (last.content.clone(), prior.to_vec()),
        None => (String::new(), Vec::new()),
    };
    let history = conversation_history(
        prior
            .iter()
            .map(|message| (message.role.as_str(), message.content.as_str())),
    );

    let agent = run_agent(
        state.agent_model.clone(),
        toolbox,
        history,
        input,
        state.cfg.agent_max_iterations,
    );
    let progress = progress_rx.into_event_source(state.cfg.idle_policy());
    let mut merged = Box::pin(merge_sources(vec![agent, progress]));
    let telemetry = state.telemetry.clone();

    async_stream::stream! {
        let started_at = Instant::now();
        let mut events = 0usize;
        while let Some(event) = merged.next().await {
            events += 1;
            yield event;
        }
        yield StreamEvent::Done;

        telemetry.emit(
            "agent.stream.completed",
            json!({
                "owner_id": owner_id,
                "events": events,
                "latency_ms": round_metric(started_at.elapsed().as_secs_f64() * 1000.0)
            }),
        );
    }
}

pub async fn handle_agent_chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<AgentChatRequest>,
) -> Result<Response, ApiError> {
    let user = authenticate(&state, &headers).await?;
    if request.messages.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "messages cannot be empty for /v1/ai/chat/agent",
        ));
    }

    tracing::info!(user_id = user.id, messages = request.messages.len(), "agent chat started");
    let frames = agent_event_stream(&state, user.id, request.messages)
        .map(|event| Ok::<_, Infallible>(Event::default().data(event.to_json())));

    let mut response = Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    Ok(response)
}

pub async fn handle_search(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<SearchRequest>,
) -> ApiResult<SearchResponse> {
    let user = authenticate(&state, &headers).await?;
    let query = request.query.trim().to_string();
    if query.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "query cannot be empty for /v1/ai/search",
        ));
    }

    let (progress_tx, mut progress_rx) = progress_channel();
    let resources = state.resolver().resolve(user.id, &query, &progress_tx).await;
    let progress = progress_rx
        .drain()
        .into_iter()
        .map(|event| event.message)
        .collect::<Vec<_>>();

    let mut cards = Vec::with_capacity(resources.len());
    for resource in &resources {
        let tags = state
            .store
            .tags_for_resource(user.id, resource.id)
            .await
            .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
        cards.push(ResourceCard::from_resource(resource, tags));
    }

    Ok(Json(SearchResponse {
        query,
        count: cards.len(),
        resources: cards,
        progress,
    }))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/ai/chat/agent", post(handle_agent_chat))
        .route("/v1/ai/search", post(handle_search))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;

    let store = SqliteBookmarkStore::open(&cfg.db_url).await?;
    store.migrate().await?;
    let client = Arc::new(ChatClient::new(&cfg)?);
    if cfg.ai_api_key().is_none() {
        tracing::warn!(
            env = %cfg.ai_api_key_env,
            "AI API key is not set; searches will use keyword fallback and the agent will fail"
        );
    }

    let state = Arc::new(ServerState {
        cfg: cfg.clone(),
        store: Arc::new(store),
        oracle_backend: client.clone(),
        agent_model: client.clone(),
        fetcher: Arc::new(ReaderFetcher::new(&cfg)?),
        metrics: Arc::new(ResolverMetrics::default()),
        telemetry: telemetry.clone(),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "model": client.model(),
            "progress_idle_ms": cfg.idle_policy().idle_budget().as_millis() as u64
        }),
    );

    println!(
        "Server listening on http://{} (health: /healthz, agent: /v1/ai/chat/agent, search: /v1/ai/search)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
