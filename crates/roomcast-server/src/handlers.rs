//! HTTP handlers for the roomcast server.
//!
//! Every protected route takes an [`AuthenticatedUser`] as its first
//! extractor, so the session is checked before any other work. Live
//! streams are served as server-sent events, one stream per room.

use crate::config::{Config, TransportConfig, TransportKind};
use crate::credentials::{CredentialError, CredentialStore};
use crate::metrics::{self, StreamMetricsGuard};
use anyhow::Result;
use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use roomcast_core::{
    AuthError, ChatMessage, Engine, EngineConfig, EngineError, Identity, JwtSessions, MemoryLog,
    Record, Viewer,
};
use roomcast_transport::{LocalTransport, Transport};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The distribution engine.
    pub engine: Arc<Engine>,
    /// Accounts.
    pub credentials: Arc<CredentialStore>,
    /// Server configuration.
    pub config: Config,
    /// Flipped to `true` when the server shuts down; ends open streams.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Create state over a transport.
    #[must_use]
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let verifier = Arc::new(JwtSessions::new(
            config.auth.secret.as_bytes(),
            config.token_ttl(),
        ));
        let engine = Engine::new(
            transport,
            Arc::new(MemoryLog::new()),
            verifier,
            EngineConfig {
                client_capacity: config.limits.client_capacity,
            },
        );

        Self {
            engine: Arc::new(engine),
            credentials: Arc::new(CredentialStore::new()),
            config,
            shutdown: watch::channel(false).0,
        }
    }
}

/// Run the HTTP server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the transport cannot be built or the server fails
/// to start.
pub async fn run_server(config: Config) -> Result<()> {
    let transport = build_transport(&config.transport).await?;
    let state = Arc::new(AppState::new(config.clone(), transport));

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_stats_exporter(
            Arc::clone(&state.engine),
            std::time::Duration::from_millis(config.metrics.stats_interval_ms.max(100)),
        );
    }

    let app = router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("roomcast listening on {}", addr);

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutting down, closing live streams");
            shutdown_state.shutdown.send_replace(true);
        })
        .await?;

    Ok(())
}

async fn build_transport(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match config.kind {
        TransportKind::Local => {
            info!(capacity = config.local_capacity, "Using in-process transport");
            Ok(Arc::new(LocalTransport::with_capacity(config.local_capacity)))
        }
        TransportKind::Redis => redis_transport(&config.redis_url).await,
    }
}

#[cfg(feature = "redis")]
async fn redis_transport(url: &str) -> Result<Arc<dyn Transport>> {
    use anyhow::Context;

    let transport = roomcast_transport::RedisTransport::connect(url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {url}"))?;
    info!(url = %url, "Using Redis transport");
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "redis"))]
async fn redis_transport(_url: &str) -> Result<Arc<dyn Transport>> {
    anyhow::bail!("transport kind \"redis\" requires building with the `redis` feature")
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.limits.max_message_size;

    Router::new()
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/send", post(send_handler))
        .route("/typing", post(typing_handler))
        .route("/history", get(history_handler))
        .route("/rooms", get(rooms_handler))
        .route("/stream", get(stream_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The identity behind the request's session token.
///
/// Read from the `Authorization` header, or from the `access_token` query
/// parameter when the header is absent.
pub struct AuthenticatedUser(pub Identity);

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = match parts.headers.get(header::AUTHORIZATION) {
            Some(value) => value.to_str().ok().map(str::to_string),
            None => Query::<TokenQuery>::try_from_uri(&parts.uri)
                .ok()
                .and_then(|Query(query)| query.access_token),
        };

        state
            .engine
            .authenticate(token.as_deref())
            .map(AuthenticatedUser)
            .map_err(ApiError::from)
    }
}

/// An error rendered as a JSON response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Auth(AuthError::Issue(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Auth(_) => StatusCode::UNAUTHORIZED,
            EngineError::InvalidRoom(_) => StatusCode::BAD_REQUEST,
            EngineError::Persistence(_) | EngineError::Protocol(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::Subscription(_) | EngineError::Transport(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        EngineError::from(err).into()
    }
}

impl From<CredentialError> for ApiError {
    fn from(err: CredentialError) -> Self {
        let (status, kind) = match &err {
            CredentialError::MissingFields => (StatusCode::BAD_REQUEST, "missing_fields"),
            CredentialError::UsernameTaken(_) => (StatusCode::CONFLICT, "username_taken"),
            CredentialError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid_credentials"),
            CredentialError::Hash(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            kind,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        metrics::record_error(self.kind);
        if self.status.is_server_error() {
            warn!(kind = self.kind, error = %self.message, "Request failed");
        } else {
            debug!(kind = self.kind, error = %self.message, "Request rejected");
        }

        let body = Json(json!({ "error": self.kind, "message": self.message }));
        (self.status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsBody {
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct SendBody {
    #[serde(default)]
    room: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TypingBody {
    #[serde(default)]
    room: String,
    #[serde(default)]
    typing: bool,
}

#[derive(Debug, Deserialize)]
struct RoomQuery {
    #[serde(default)]
    room: String,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = if state.engine.is_healthy() { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.engine.stats(),
    }))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let credentials = Arc::clone(&state.credentials);
    let identity = tokio::task::spawn_blocking(move || {
        credentials.register(&body.username, &body.password)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    let token = state.engine.issue_session(&identity)?;
    Ok(Json(json!({ "token": token })))
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CredentialsBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let credentials = Arc::clone(&state.credentials);
    let identity = tokio::task::spawn_blocking(move || {
        credentials.login(&body.username, &body.password)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    let token = state.engine.issue_session(&identity)?;
    Ok(Json(json!({ "token": token })))
}

async fn send_handler(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendBody>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .send_message(&identity, &body.room, body.content)
        .await?;
    metrics::record_message();
    Ok(StatusCode::OK)
}

async fn typing_handler(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(state): State<Arc<AppState>>,
    Json(body): Json<TypingBody>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .send_typing(&identity, &body.room, body.typing)
        .await?;
    metrics::record_typing();
    Ok(StatusCode::OK)
}

async fn history_handler(
    AuthenticatedUser(_identity): AuthenticatedUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.engine.history(&query.room).await?))
}

async fn rooms_handler(
    AuthenticatedUser(_identity): AuthenticatedUser,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.engine.rooms().await?))
}

async fn stream_handler(
    AuthenticatedUser(identity): AuthenticatedUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoomQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let viewer = state.engine.open_stream(&identity, &query.room).await?;
    info!(room = %viewer.room(), client = %viewer.id(), viewer = %identity, "Live stream opened");

    let events = viewer_events(viewer, state.shutdown.subscribe());
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.heartbeat_interval())))
}

/// Turn a viewer into an SSE event stream that ends on server shutdown.
///
/// Dropping the stream (client disconnect) drops the viewer, which
/// deregisters it.
fn viewer_events(
    viewer: Viewer,
    shutdown: watch::Receiver<bool>,
) -> impl Stream<Item = Result<Event, axum::Error>> {
    let guard = StreamMetricsGuard::new();

    stream::unfold(
        (viewer, shutdown, guard),
        |(mut viewer, mut shutdown, guard)| async move {
            tokio::select! {
                record = viewer.next() => {
                    let record = record?;
                    let event = record_event(&record);
                    Some((event, (viewer, shutdown, guard)))
                }
                () = shutdown_signalled(&mut shutdown) => {
                    debug!(room = %viewer.room(), client = %viewer.id(), "Closing stream for shutdown");
                    None
                }
            }
        },
    )
}

/// Resolves once shutdown is flagged, including a flag set before the
/// stream opened, or when the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

fn record_event(record: &Record) -> Result<Event, axum::Error> {
    Event::default().event(record.kind().as_str()).json_data(record)
}
