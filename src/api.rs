use crate::errors::{Result, SpoolerError};
use crate::printer::{check_status, OutputTargetProvider, TargetSelection};
use crate::queue::{JobId, JobSnapshot, QueueStats};
use crate::spooler::Spooler;
use crate::status::PrinterStatus;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Slow WebSocket clients that fall further behind than this skip events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// HTTP / WebSocket server state
#[derive(Clone)]
pub struct ApiState {
    pub spooler: Spooler,
    pub provider: Arc<dyn OutputTargetProvider>,
    pub target_selection: TargetSelection,
    /// Fan-out to every connected UI client
    pub events: broadcast::Sender<ServerEvent>,
    /// Daemon start time for uptime calculation
    pub start_time: Instant,
}

impl ApiState {
    pub fn new(
        spooler: Spooler,
        provider: Arc<dyn OutputTargetProvider>,
        target_selection: TargetSelection,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            spooler,
            provider,
            target_selection,
            events,
            start_time: Instant::now(),
        }
    }

    /// Send to all clients. Having none connected is not an error.
    fn broadcast(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            debug!("No WebSocket clients connected, event dropped");
        }
    }
}

/// Messages pushed to UI clients over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status(PrinterStatus),
    /// Label preview, base64 as the client sent it
    Image { image: String },
    Queue { jobs: Vec<JobSnapshot> },
}

/// Messages accepted from UI clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Print { images: Vec<String> },
}

/// Print request payload
#[derive(Debug, Deserialize, Serialize)]
pub struct PrintRequest {
    pub images: Vec<String>,
}

/// Print response
#[derive(Debug, Deserialize, Serialize)]
pub struct PrintResponse {
    pub job_ids: Vec<JobId>,
}

/// Health check response
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub queue_depth: usize,
    pub busy: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl IntoResponse for SpoolerError {
    fn into_response(self) -> Response {
        let error_string = self.to_string();
        let (status, message) = match self {
            SpoolerError::Payload(msg) => (StatusCode::BAD_REQUEST, msg),
            SpoolerError::Config(msg) => (StatusCode::BAD_REQUEST, msg),
            SpoolerError::TargetNotFound(msg) => (StatusCode::NOT_FOUND, msg),
            SpoolerError::NoTargetAvailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "No printer available".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            details: Some(error_string),
        });

        (status, body).into_response()
    }
}

/// Strip an optional `data:<mime>;base64,` prefix.
fn strip_data_url(encoded: &str) -> &str {
    let trimmed = encoded.trim();
    match trimmed.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => trimmed,
    }
}

fn decode_image(encoded: &str) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| SpoolerError::Payload(format!("Invalid base64 image: {}", e)))?;

    if bytes.is_empty() {
        return Err(SpoolerError::Payload("Empty image".to_string()));
    }
    Ok(bytes)
}

/// Check printer reachability and tell every client.
pub async fn publish_printer_status(state: &ApiState) -> PrinterStatus {
    let status = check_status(state.provider.as_ref(), &state.target_selection).await;
    info!(
        connected = status.connected,
        selected = ?status.selected,
        "Printer status updated"
    );
    state.broadcast(ServerEvent::Status(status.clone()));
    status
}

/// Bridge the spooler's single notification callback to the broadcast channel.
///
/// Bursts of notifications collapse into one `queue` event carrying the
/// latest snapshot.
pub fn spawn_queue_publisher(
    spooler: &Spooler,
    events: broadcast::Sender<ServerEvent>,
) -> JoinHandle<()> {
    let signal = Arc::new(Notify::new());
    let trigger = signal.clone();
    spooler.set_notification_callback(move || trigger.notify_one());

    let spooler = spooler.clone();
    tokio::spawn(async move {
        loop {
            signal.notified().await;
            let jobs = spooler.inspect();
            // Err only means nobody is listening
            let _ = events.send(ServerEvent::Queue { jobs });
        }
    })
}

/// Apply one inbound WebSocket text frame. Returns the ids of queued jobs.
pub fn handle_client_message(state: &ApiState, text: &str) -> Vec<JobId> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring malformed client message: {}", e);
            return Vec::new();
        }
    };

    match message {
        ClientMessage::Print { images } => {
            debug!("Print request with {} image(s)", images.len());
            let mut job_ids = Vec::with_capacity(images.len());

            for (index, encoded) in images.iter().enumerate() {
                let encoded = strip_data_url(encoded);
                let payload = match decode_image(encoded) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Skipping image {}: {}", index, e);
                        continue;
                    }
                };

                state.broadcast(ServerEvent::Image {
                    image: encoded.to_string(),
                });
                job_ids.push(state.spooler.submit(payload));
            }

            job_ids
        }
    }
}

/// GET /ws - UI WebSocket
async fn handle_ws(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<()> {
    let json = serde_json::to_string(event)?;
    sender
        .send(Message::Text(json))
        .await
        .map_err(|e| SpoolerError::Other(anyhow::anyhow!("WebSocket send failed: {}", e)))
}

async fn client_session(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.events.subscribe();
    info!("UI client connected");

    let snapshot = ServerEvent::Queue {
        jobs: state.spooler.inspect(),
    };
    if send_event(&mut sender, &snapshot).await.is_err() {
        return;
    }
    publish_printer_status(&state).await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Err(e) = send_event(&mut sender, &event).await {
                        debug!("{}", e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("UI client lagging, skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_message(&state, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket receive error: {}", e);
                    break;
                }
            },
        }
    }

    info!("UI client disconnected");
}

/// POST /api/print - Queue base64 images; all-or-nothing
async fn handle_print(
    State(state): State<ApiState>,
    Json(request): Json<PrintRequest>,
) -> Result<Json<PrintResponse>> {
    let decoded = request
        .images
        .iter()
        .map(|encoded| {
            let encoded = strip_data_url(encoded);
            decode_image(encoded).map(|payload| (encoded, payload))
        })
        .collect::<Result<Vec<_>>>()?;

    let job_ids = decoded
        .into_iter()
        .map(|(encoded, payload)| {
            state.broadcast(ServerEvent::Image {
                image: encoded.to_string(),
            });
            state.spooler.submit(payload)
        })
        .collect();

    Ok(Json(PrintResponse { job_ids }))
}

/// GET /api/queue
async fn handle_queue(State(state): State<ApiState>) -> Json<Vec<JobSnapshot>> {
    Json(state.spooler.inspect())
}

/// GET /api/status
async fn handle_status(State(state): State<ApiState>) -> Json<PrinterStatus> {
    Json(check_status(state.provider.as_ref(), &state.target_selection).await)
}

/// GET /api/stats
async fn handle_stats(State(state): State<ApiState>) -> Json<QueueStats> {
    Json(state.spooler.stats())
}

/// GET /api/health
async fn handle_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        queue_depth: state.spooler.len(),
        busy: state.spooler.is_busy(),
    })
}

/// Create the HTTP router; `static_dir` serves the UI for unmatched paths.
pub fn create_router(state: ApiState, static_dir: Option<&Path>) -> Router {
    let mut router = Router::new()
        .route("/ws", get(handle_ws))
        .route("/api/print", post(handle_print))
        .route("/api/queue", get(handle_queue))
        .route("/api/status", get(handle_status))
        .route("/api/stats", get(handle_stats))
        .route("/api/health", get(handle_health));

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(AllowOrigin::predicate(|origin, _| {
                            let o = origin.as_bytes();
                            o.starts_with(b"http://localhost")
                                || o.starts_with(b"https://localhost")
                                || o.starts_with(b"http://127.0.0.1")
                        }))
                        .allow_methods([
                            axum::http::Method::GET,
                            axum::http::Method::POST,
                            axum::http::Method::OPTIONS,
                        ])
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn start_api_server<F>(
    addr: &str,
    state: ApiState,
    static_dir: Option<&Path>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, static_dir);

    info!("Starting HTTP server on {}", addr);
    match static_dir {
        Some(dir) if dir.is_dir() => info!("Serving UI from {:?}", dir),
        Some(dir) => warn!("Static UI directory {:?} does not exist", dir),
        None => {}
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("HTTP server error: {}", e);
            e.into()
        })
}
