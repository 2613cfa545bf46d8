use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use lexstream_agent::DemoLegalAgent;
use lexstream_events::SinkCapacity;
use lexstream_kernel::{StreamKernel, StreamKernelBuilder};
use lexstream_protocol::{BroadcastRequest, ConnectionId, StatusReport};
use lexstream_runtime::{InboundFrame, OutboundFrame, RuntimeConfig, SessionPolicy};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

mod openapi;

use crate::openapi::{openapi_spec, scalar_docs_html};

/// How long a closed connection's writer may keep flushing queued frames.
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "lexstream-api")]
#[command(about = "Real-time agent event streaming server")]
struct Cli {
    #[arg(long, env = "LEXSTREAM_LISTEN", default_value = "127.0.0.1:8000")]
    listen: SocketAddr,
    #[arg(long, env = "LEXSTREAM_MAX_EXECUTION_SECS", default_value_t = 300)]
    max_execution_secs: u64,
    /// Per-session event queue bound; 0 means unbounded.
    #[arg(long, env = "LEXSTREAM_QUEUE_CAPACITY", default_value_t = 10_000)]
    queue_capacity: usize,
    /// Frames buffered per connection ahead of the socket writer.
    #[arg(long, env = "LEXSTREAM_OUTBOUND_BUFFER", default_value_t = 256)]
    outbound_buffer: usize,
    /// Queue up to N queries behind the running one instead of rejecting them.
    #[arg(long, env = "LEXSTREAM_QUEUE_QUERIES")]
    queue_queries: Option<usize>,
    #[arg(long, env = "LEXSTREAM_MAX_QUERY_CHARS", default_value_t = 4000)]
    max_query_chars: usize,
    /// Pause between the demo agent's lifecycle phases.
    #[arg(long, env = "LEXSTREAM_DEMO_STEP_DELAY_MS", default_value_t = 250)]
    demo_step_delay_ms: u64,
    /// Comma-separated allowed origins, or `*` for any.
    #[arg(long, env = "CORS_ALLOWED_ORIGINS", default_value = "*")]
    cors_allowed_origins: String,
}

impl Cli {
    fn runtime_config(&self) -> RuntimeConfig {
        let sink_capacity = match self.queue_capacity {
            0 => SinkCapacity::Unbounded,
            n => SinkCapacity::Bounded(n),
        };
        let session_policy = match self.queue_queries {
            Some(max_pending) => SessionPolicy::Queue { max_pending },
            None => SessionPolicy::Reject,
        };
        RuntimeConfig::new()
            .max_execution(Duration::from_secs(self.max_execution_secs))
            .sink_capacity(sink_capacity)
            .outbound_buffer(self.outbound_buffer)
            .session_policy(session_policy)
            .max_query_chars(self.max_query_chars)
    }
}

#[derive(Clone)]
struct AppState {
    kernel: StreamKernel,
}

#[derive(Debug, Serialize)]
struct BroadcastResponse {
    message: String,
    attempted: usize,
    delivered: usize,
    failed: Vec<ConnectionId>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let engine = DemoLegalAgent::with_sample_documents()
        .step_delay(Duration::from_millis(cli.demo_step_delay_ms));
    let kernel = StreamKernelBuilder::new(Arc::new(engine))
        .config(cli.runtime_config())
        .build();
    let cors = cors_layer(&cli.cors_allowed_origins)?;

    let app = router(AppState { kernel }, cors);

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!(listen = %cli.listen, "lexstream-api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(docs))
        .route("/docs/", get(docs))
        .route("/ws/query", get(ws_query))
        .route("/ws/status", get(status))
        .route("/ws/broadcast", post(broadcast))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed_origins: &str) -> Result<CorsLayer> {
    let origins: Vec<&str> = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .collect();
    if origins.is_empty() || origins.contains(&"*") {
        return Ok(CorsLayer::permissive());
    }

    let origins = origins
        .into_iter()
        .map(|origin| {
            HeaderValue::from_str(origin).with_context(|| format!("invalid CORS origin: {origin}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]))
}

async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "lexstream-api",
        "engine": state.kernel.engine_name(),
    }))
}

async fn openapi_json() -> Json<serde_json::Value> {
    Json(openapi_spec())
}

async fn docs() -> Html<String> {
    Html(scalar_docs_html("/openapi.json"))
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.kernel.status())
}

async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> ApiResult<Json<BroadcastResponse>> {
    if request.message.trim().is_empty() {
        return Err(ApiError::bad_request("'message' must not be empty"));
    }
    let report = state
        .kernel
        .broadcast(&request)
        .map_err(|error| ApiError::bad_request(error.to_string()))?;

    Ok(Json(BroadcastResponse {
        message: format!("Broadcast sent to {} connections", report.attempted),
        attempted: report.attempted,
        delivered: report.delivered,
        failed: report.failed,
    }))
}

async fn ws_query(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_query_socket(state, socket))
}

async fn handle_query_socket(state: AppState, socket: WebSocket) {
    let (mut writer, reader) = socket.split();
    let (outbound, mut frames) =
        mpsc::channel::<OutboundFrame>(state.kernel.config().outbound_buffer);
    let closed = CancellationToken::new();

    let writer_closed = closed.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if let Err(error) = writer.send(Message::Text(String::from(&*frame).into())).await {
                debug!(%error, "websocket write failed");
                writer_closed.cancel();
                break;
            }
        }
        if let Err(error) = writer.close().await {
            debug!(%error, "websocket close failed");
        }
    });

    let inbound = reader.filter_map(|message| async move { inbound_frame(message) });
    let summary = state.kernel.serve_connection(inbound, outbound, closed).await;

    match tokio::time::timeout(WRITER_FLUSH_TIMEOUT, &mut writer_task).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(%error, "websocket writer task failed"),
        Err(_) => {
            warn!(connection_id = %summary.connection_id, "websocket writer did not flush in time");
            writer_task.abort();
        }
    }
}

fn inbound_frame(message: Result<Message, axum::Error>) -> Option<InboundFrame> {
    match message {
        Ok(Message::Text(text)) => Some(InboundFrame::Text(text.as_str().to_owned())),
        Ok(Message::Binary(bytes)) => Some(InboundFrame::Binary(bytes.to_vec())),
        Ok(Message::Close(_)) => Some(InboundFrame::Close),
        Ok(Message::Ping(_) | Message::Pong(_)) => None,
        Err(error) => {
            debug!(%error, "websocket read failed");
            Some(InboundFrame::Close)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    {
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(error) => {
                    tracing::error!(%error, "failed to install SIGTERM handler");
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }
}
