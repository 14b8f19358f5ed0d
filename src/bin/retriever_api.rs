use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use lru::LruCache;
use portfolio_rag::config::{ChatArgs, EmbedderArgs, PolicyArgs, StoreArgs};
use portfolio_rag::error::{EmbedError, RagError};
use portfolio_rag::telemetry::init_tracing;
use portfolio_rag::{
    AnswerComposer, ChatMessage, Intent, MetadataFilter, Query, RetrievalResult, RetrievedChunk,
    Retriever, VectorStore, FAILED_RESPONSE,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "portfolio-retriever",
    about = "HTTP API that classifies, retrieves and answers portfolio questions"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "PORTFOLIO_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Maximum top-k a client may request.
    #[arg(long, default_value_t = 12)]
    max_top_k: usize,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    #[command(flatten)]
    embedder: EmbedderArgs,

    #[command(flatten)]
    store: StoreArgs,

    #[command(flatten)]
    policy: PolicyArgs,

    #[command(flatten)]
    chat: ChatArgs,
}

#[derive(Clone)]
struct AppState {
    retriever: Arc<Retriever>,
    composer: Arc<AnswerComposer>,
    max_top_k: usize,
    embedding_cache: Option<Arc<Mutex<LruCache<String, Vec<f32>>>>>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    query: String,
}

#[derive(Debug, Serialize)]
struct ClassifyResponse {
    intent: Intent,
    top_k: usize,
    min_similarity: f32,
}

#[derive(Debug, Deserialize)]
struct RetrieveRequest {
    query: String,
    #[serde(default)]
    filter: Option<MetadataFilter>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RetrieveResponse {
    intent: Intent,
    hits: Vec<RetrievedChunk>,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ResponseMeta {
    latency_ms: f64,
    candidates: usize,
    min_similarity: f32,
}

#[derive(Debug, Deserialize)]
struct ChatTurnRequest {
    query: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    history: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ChatTurnResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn main() -> Result<()> {
    init_tracing("info");
    let cli = ApiCli::parse();

    // Components are built before the server runtime exists: the pgvector
    // backend drives its own runtime and must not be created inside another.
    let embedder = Arc::new(cli.embedder.build().context("failed to build embedder")?);
    let store: Arc<dyn VectorStore> = cli.store.open().context("failed to open vector store")?;
    let policy = cli.policy.load().context("failed to load retrieval policy")?;
    let retriever = Arc::new(Retriever::new(
        embedder,
        store.clone(),
        cli.store.collection.clone(),
        policy,
    ));
    match retriever.checked_manifest(None) {
        Ok(manifest) => info!(
            collection = %manifest.collection,
            model = %manifest.embedding_model,
            dimensions = ?manifest.dimensions,
            "serving collection"
        ),
        Err(err) => warn!(error = %err, "collection is not ready; queries will fail until it is"),
    }
    let chatter = cli
        .chat
        .build(cli.embedder.openai_api_key.as_deref())
        .context("failed to build chat client")?;
    let composer = Arc::new(AnswerComposer::new(chatter, cli.chat.composer_config()));

    let state = AppState {
        retriever,
        composer,
        max_top_k: cli.max_top_k.max(1),
        embedding_cache: build_cache(cli.embedding_cache_size),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    let served = runtime.block_on(serve(app(state), addr));
    drop(runtime);
    drop(store);
    served
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/classify", post(classify_handler))
        .route("/v1/retrieve", post(retrieve_handler))
        .route("/v1/chat", post(chat_handler))
        .with_state(state)
}

async fn serve(app: Router, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "portfolio-retriever listening");
    axum::serve(listener, app).await.context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn classify_handler(
    State(state): State<AppState>,
    Json(request): Json<ClassifyRequest>,
) -> Result<Json<ClassifyResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    let query = state.retriever.prepare(&request.query);
    Ok(Json(ClassifyResponse {
        intent: query.intent,
        top_k: query.top_k,
        min_similarity: query.min_similarity,
    }))
}

async fn retrieve_handler(
    State(state): State<AppState>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    acquire(&state).await?;
    let start = Instant::now();
    let mut query = state.retriever.prepare(&request.query);
    if let Some(top_k) = request.top_k {
        query = query.with_top_k(top_k.min(state.max_top_k));
    }
    let result = run_retrieval(&state, query, request.filter)
        .await
        .map_err(|err| error_response(&err, err.to_string()))?;
    Ok(Json(RetrieveResponse {
        intent: result.query.intent,
        meta: ResponseMeta {
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            candidates: result.candidates,
            min_similarity: result.query.min_similarity,
        },
        hits: result.hits,
    }))
}

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatTurnRequest>,
) -> Result<Json<ChatTurnResponse>, ApiError> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    acquire(&state).await?;
    let query = state.retriever.prepare(&request.query);
    let result = run_retrieval(&state, query, None).await.map_err(|err| {
        error!(error = %err, "retrieval failed during chat turn");
        error_response(&err, FAILED_RESPONSE.to_string())
    })?;

    let composer = state.composer.clone();
    let answer = tokio::task::spawn_blocking(move || {
        composer.compose(
            &request.query,
            &result,
            &request.history,
            request.language.as_deref(),
        )
    })
    .await
    .map_err(|err| {
        error!(error = %err, "chat task join error");
        internal_error(FAILED_RESPONSE)
    })?
    .map_err(|err| {
        error!(error = %err, "chat turn failed");
        internal_error(FAILED_RESPONSE)
    })?;
    Ok(Json(ChatTurnResponse { response: answer }))
}

/// Embeds (or reuses a cached embedding for) `query` and searches the collection.
async fn run_retrieval(
    state: &AppState,
    query: Query,
    filter: Option<MetadataFilter>,
) -> Result<RetrievalResult, RagError> {
    let key = query.embedding_text.clone();
    let cached = match &state.embedding_cache {
        Some(cache) => cache.lock().await.get(&key).cloned(),
        None => None,
    };

    let retriever = state.retriever.clone();
    let (result, fresh) = tokio::task::spawn_blocking(move || -> Result<_, RagError> {
        match cached {
            Some(vector) => retriever
                .search(query, &vector, filter.as_ref())
                .map(|result| (result, None)),
            None => {
                retriever.checked_manifest(None)?;
                let vector = retriever.embed(&query)?;
                let result = retriever.search(query, &vector, filter.as_ref())?;
                Ok((result, Some(vector)))
            }
        }
    })
    .await
    .map_err(|err| RagError::config(format!("retrieval task join error: {err}")))??;

    if let (Some(cache), Some(vector)) = (&state.embedding_cache, fresh) {
        cache.lock().await.put(key, vector);
    }
    Ok(result)
}

async fn acquire(state: &AppState) -> Result<(), ApiError> {
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            return Err(too_many_requests("rate limit exceeded"));
        }
    }
    Ok(())
}

fn status_for(err: &RagError) -> StatusCode {
    match err {
        RagError::EmbeddingSpaceMismatch { .. } => StatusCode::CONFLICT,
        RagError::CollectionNotFound(_) => StatusCode::NOT_FOUND,
        RagError::RetriesExhausted {
            last: EmbedError::RateLimited { .. },
            ..
        }
        | RagError::Embedding(EmbedError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
        RagError::RetriesExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-actionable errors keep their own message; everything else gets `fallback`.
fn error_response(err: &RagError, fallback: String) -> ApiError {
    let status = status_for(err);
    let message = match status {
        StatusCode::INTERNAL_SERVER_ERROR => fallback,
        _ => err.to_string(),
    };
    (status, Json(ErrorBody { message }))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn internal_error(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn too_many_requests(message: impl Into<String>) -> ApiError {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn build_cache(size: usize) -> Option<Arc<Mutex<LruCache<String, Vec<f32>>>>> {
    NonZeroUsize::new(size).map(|capacity| Arc::new(Mutex::new(LruCache::new(capacity))))
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        let refill_per_sec = max_per_minute as f64 / 60.0;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_then_rejects() {
        let limiter = RateLimiter::new(1, 2).unwrap();
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
    }

    #[test]
    fn rate_limiter_disabled_by_zero() {
        assert!(RateLimiter::new(0, 5).is_none());
        assert!(RateLimiter::new(60, 0).is_none());
    }

    #[test]
    fn errors_map_to_statuses() {
        let missing = RagError::CollectionNotFound("portfolio".into());
        assert_eq!(status_for(&missing), StatusCode::NOT_FOUND);
        let mismatch = RagError::EmbeddingSpaceMismatch {
            collection: "portfolio".into(),
            indexed_model: "a".into(),
            indexed_dimensions: Some(3),
            query_model: "b".into(),
            query_dimensions: None,
        };
        assert_eq!(status_for(&mismatch), StatusCode::CONFLICT);
        let throttled = RagError::Embedding(EmbedError::RateLimited { retry_after: None });
        assert_eq!(status_for(&throttled), StatusCode::TOO_MANY_REQUESTS);
        let throttled_out = RagError::RetriesExhausted {
            attempts: 3,
            last: EmbedError::RateLimited { retry_after: None },
        };
        assert_eq!(status_for(&throttled_out), StatusCode::TOO_MANY_REQUESTS);
        let timed_out = RagError::RetriesExhausted {
            attempts: 3,
            last: EmbedError::Timeout,
        };
        assert_eq!(status_for(&timed_out), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_errors_hide_diagnostics() {
        let err = RagError::config("secret connection string");
        let (status, Json(body)) = error_response(&err, FAILED_RESPONSE.to_string());
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, FAILED_RESPONSE);
    }
}
