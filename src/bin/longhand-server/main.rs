use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};
use uuid::Uuid;

mod metrics;

use longhand::assembler::Assembler;
use longhand::backends::{HttpLlmBackend, HttpSpeechBackend};
use longhand::blob::MemoryBlobStore;
use longhand::coordinator::UploadCoordinator;
use longhand::events::EventHub;
use longhand::job_store::{ParentJobStore, SubJobStore};
use longhand::kv::MemoryKvStore;
use longhand::limiter::{GateLimits, RateLimiter};
use longhand::opts::{LlmMode, ProcessingOptions};
use longhand::processor::ChunkProcessor;

const UPLOAD_BUCKET: &str = "longhand";

#[derive(Parser, Debug)]
#[command(name = "longhand-server")]
#[command(about = "HTTP server for chunked streaming audio transcription")]
struct Params {
    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 8080)]
    port: u16,

    /// Maximum request body size (bytes). Must exceed the largest chunk size plus
    /// multipart overhead.
    #[arg(long = "max-bytes", default_value_t = 110 * 1024 * 1024)]
    max_bytes: usize,

    /// Speech-to-text endpoint (OpenAI-compatible transcription API).
    #[arg(
        long = "speech-url",
        default_value = "https://api.groq.com/openai/v1/audio/transcriptions"
    )]
    speech_url: String,

    /// Chat-completions endpoint for LLM transcript correction.
    #[arg(
        long = "llm-url",
        default_value = "https://api.groq.com/openai/v1/chat/completions"
    )]
    llm_url: String,

    /// API key for both upstream endpoints.
    #[arg(long = "api-key", env = "LONGHAND_API_KEY")]
    api_key: String,

    /// Default speech model.
    #[arg(long = "speech-model", default_value = "whisper-large-v3")]
    speech_model: String,

    /// LLM model for transcript correction.
    #[arg(long = "llm-model", default_value = "llama-3.3-70b-versatile")]
    llm_model: String,

    /// Concurrent chunk-processing tasks.
    #[arg(long = "max-concurrent-chunks", default_value_t = 4)]
    max_concurrent_chunks: usize,

    /// Concurrent upstream transcription requests.
    #[arg(long = "max-concurrent-transcriptions", default_value_t = 8)]
    max_concurrent_transcriptions: usize,
}

#[derive(Clone)]
struct AppState {
    coordinator: Arc<UploadCoordinator>,
    hub: Arc<EventHub>,
    limiter: Arc<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct InitializeBody {
    filename: String,
    total_size: u64,
    #[serde(default)]
    chunk_size_mb: Option<u64>,
    #[serde(default)]
    use_llm: bool,
    #[serde(default)]
    llm_mode: Option<LlmMode>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    webhook_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    parent_job_id: Uuid,
    chunk_index: u32,
    #[serde(default)]
    actual_size: u64,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    parent_job_id: Uuid,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RetryBody {
    parent_job_id: Uuid,
    chunk_index: u32,
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    parent_job_id: Uuid,
}

#[derive(Debug, serde::Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<longhand::Error> for AppError {
    fn from(err: longhand::Error) -> Self {
        let status = match &err {
            longhand::Error::Validation(_) => StatusCode::BAD_REQUEST,
            longhand::Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[tokio::main]
async fn main() {
    longhand::init_logging();

    if let Err(err) = run().await {
        error!(error = ?err, "longhand-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let params = Params::parse();

    if let Err(err) = metrics::init() {
        tracing::warn!(error = ?err, "metrics disabled (init failed)");
    }

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    let state = build_state(&params).context("failed to assemble the pipeline")?;

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/limits", get(limits))
        .route("/chunked-upload-stream", post(initialize))
        .route("/chunked-stream/{parent_job_id}", get(stream))
        .route("/chunk-upload", post(chunk_upload))
        .route("/chunk-upload-complete", post(chunk_upload_complete))
        .route("/chunked-upload-status", get(status))
        .route("/chunked-upload-cancel", post(cancel))
        .route("/chunked-upload-retry", post(retry))
        .route_layer(axum::middleware::from_fn(metrics::track_http_metrics))
        .with_state(state)
        .layer(DefaultBodyLimit::max(params.max_bytes))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn build_state(params: &Params) -> Result<AppState> {
    let kv = Arc::new(MemoryKvStore::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let parents = ParentJobStore::new(kv.clone());
    let sub_jobs = SubJobStore::new(kv);

    let limiter = Arc::new(RateLimiter::new(GateLimits {
        transcription: params.max_concurrent_transcriptions,
        chunk_processing: params.max_concurrent_chunks,
        ..GateLimits::default()
    }));
    let hub = Arc::new(EventHub::new());

    let speech = Arc::new(
        HttpSpeechBackend::new(&params.speech_url, &params.api_key)
            .map_err(|err| anyhow::anyhow!("{err}"))?
            .with_default_model(&params.speech_model),
    );
    let llm = Arc::new(
        HttpLlmBackend::new(&params.llm_url, &params.api_key)
            .map_err(|err| anyhow::anyhow!("{err}"))?
            .with_model(&params.llm_model),
    );

    let assembler = Arc::new(Assembler::new(
        parents.clone(),
        sub_jobs.clone(),
        Some(llm.clone()),
        limiter.clone(),
        hub.clone(),
    ));
    let processor = Arc::new(ChunkProcessor::new(
        parents.clone(),
        sub_jobs.clone(),
        blob.clone(),
        speech,
        Some(llm),
        limiter.clone(),
        hub.clone(),
        assembler,
        UPLOAD_BUCKET,
    ));
    let coordinator = Arc::new(UploadCoordinator::new(
        parents,
        sub_jobs,
        blob,
        limiter.clone(),
        hub.clone(),
        processor,
        None,
        UPLOAD_BUCKET,
    ));

    Ok(AppState {
        coordinator,
        hub,
        limiter,
    })
}

async fn root() -> &'static str {
    "longhand-server: POST /chunked-upload-stream to start a chunked transcription"
}

async fn healthz() -> &'static str {
    "ok"
}

async fn limits(State(state): State<AppState>) -> Response {
    Json(state.limiter.snapshot()).into_response()
}

async fn initialize(
    State(state): State<AppState>,
    Json(body): Json<InitializeBody>,
) -> std::result::Result<Response, AppError> {
    let options = ProcessingOptions {
        use_llm: body.use_llm,
        llm_mode: body.llm_mode,
        model: body.model,
        webhook_url: body.webhook_url,
    };
    let response = state
        .coordinator
        .initialize(&body.filename, body.total_size, body.chunk_size_mb, options)
        .await?;
    Ok(Json(response).into_response())
}

async fn stream(
    State(state): State<AppState>,
    Path(parent_job_id): Path<Uuid>,
) -> Response {
    match state.hub.subscribe(parent_job_id) {
        Some(rx) => {
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                let event = rx.recv().await?;
                let data = serde_json::to_string(&event)
                    .unwrap_or_else(|_| "{\"type\":\"error\"}".to_owned());
                Some((Ok::<Event, Infallible>(Event::default().data(data)), rx))
            });
            Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
        }
        // Unknown, finished, or already-subscribed parents get an immediately closed
        // stream rather than an error, so clients can treat both cases uniformly.
        None => Sse::new(futures_util::stream::empty::<
            std::result::Result<Event, Infallible>,
        >())
        .into_response(),
    }
}

async fn chunk_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> std::result::Result<Response, AppError> {
    let mut parent_job_id: Option<Uuid> = None;
    let mut chunk_index: Option<u32> = None;
    let mut chunk_bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {err}")))?
    {
        match field.name() {
            Some("chunk") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::bad_request(format!("failed to read chunk: {err}")))?;
                chunk_bytes = Some(bytes.to_vec());
            }
            Some("parent_job_id") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                parent_job_id = Some(
                    Uuid::parse_str(text.trim())
                        .map_err(|_| AppError::bad_request("parent_job_id is not a UUID"))?,
                );
            }
            Some("chunk_index") => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(err.to_string()))?;
                chunk_index = Some(
                    text.trim()
                        .parse()
                        .map_err(|_| AppError::bad_request("chunk_index is not a number"))?,
                );
            }
            // `expected_size` is advisory; the coordinator validates against the plan.
            _ => {}
        }
    }

    let parent_job_id =
        parent_job_id.ok_or_else(|| AppError::bad_request("missing field parent_job_id"))?;
    let chunk_index =
        chunk_index.ok_or_else(|| AppError::bad_request("missing field chunk_index"))?;
    let chunk_bytes = chunk_bytes.ok_or_else(|| AppError::bad_request("missing field chunk"))?;

    let accepted = state
        .coordinator
        .accept_chunk_upload(parent_job_id, chunk_index, chunk_bytes)
        .await?;
    metrics::record_chunk_upload();
    Ok(Json(accepted).into_response())
}

async fn chunk_upload_complete(
    State(state): State<AppState>,
    Json(body): Json<CompleteBody>,
) -> std::result::Result<Response, AppError> {
    let accepted = state
        .coordinator
        .complete_chunk_upload(body.parent_job_id, body.chunk_index, body.actual_size)
        .await?;
    metrics::record_chunk_upload();
    Ok(Json(accepted).into_response())
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> std::result::Result<Response, AppError> {
    let report = state.coordinator.status(query.parent_job_id).await?;
    Ok(Json(report).into_response())
}

async fn cancel(
    State(state): State<AppState>,
    Json(body): Json<CancelBody>,
) -> std::result::Result<Response, AppError> {
    let parent = state
        .coordinator
        .cancel(body.parent_job_id, body.reason.as_deref())
        .await?;
    Ok(Json(serde_json::json!({
        "parent_job_id": parent.id,
        "status": parent.status,
        "cancelled_at": parent.cancelled_at,
    }))
    .into_response())
}

async fn retry(
    State(state): State<AppState>,
    Json(body): Json<RetryBody>,
) -> std::result::Result<Response, AppError> {
    let outcome = state
        .coordinator
        .retry(body.parent_job_id, body.chunk_index)
        .await?;
    Ok(Json(outcome).into_response())
}
