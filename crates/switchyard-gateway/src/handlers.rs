//! HTTP routes for the Switchyard server.
//!
//! - WebSocket upgrade on the configured path
//! - `GET /health`
//! - `POST <publish.path>` plus directory sync routes, when `publish.token` is set

use crate::auth::JwtAuthenticator;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use switchyard_core::{
    accept, broadcast_to_members, spawn_presence_fanout, DeliveryReport, Hub, InMemoryDirectory,
    MemberDirectory, SessionContext,
};
use switchyard_protocol::Event;
use switchyard_transport::websocket;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Upper bound on a WebSocket message before the read loop sees it, as a
/// multiple of the frame limit.
const UPGRADE_SIZE_FACTOR: usize = 4;

/// Shared server state.
pub struct AppState {
    /// Connection registry and router.
    pub hub: Arc<Hub>,
    /// Membership pushed in through the directory routes.
    pub directory: Arc<InMemoryDirectory>,
    /// Everything a connection needs after the upgrade.
    pub session: SessionContext,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let hub = Arc::new(Hub::with_config(config.hub_config()));
        let directory = Arc::new(InMemoryDirectory::new());
        let authenticator = Arc::new(JwtAuthenticator::new(&config.auth));

        let session = SessionContext::new(Arc::clone(&hub), authenticator)
            .with_directory(Arc::clone(&directory) as Arc<dyn MemberDirectory>)
            .with_config(config.client_config());

        Self {
            hub,
            directory,
            session,
            config,
        }
    }
}

/// Build the route table.
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler));

    if state.config.publish.token.is_some() {
        app = app
            .route(&state.config.publish.path, post(publish_handler))
            .route(
                "/internal/directory/servers/:server_id/members/:user_id",
                put(add_member_handler).delete(remove_member_handler),
            )
            .route(
                "/internal/directory/conversations/:conversation_id",
                put(set_conversation_handler),
            );
    }

    app.with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        spawn_stats_sampler(
            Arc::clone(&state.hub),
            Duration::from_millis(config.metrics.sample_interval_ms),
        );
    }

    spawn_presence_fanout(
        Arc::clone(&state.hub),
        Arc::clone(&state.directory) as Arc<dyn MemberDirectory>,
    );

    let app = router(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Switchyard server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );
    if config.publish.token.is_some() {
        info!("Publish endpoint: http://{}{}", addr, config.publish.path);
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Copy hub statistics into the metrics gauges on an interval.
fn spawn_stats_sampler(hub: Arc<Hub>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(100)));
        loop {
            interval.tick().await;
            metrics::record_hub_stats(&hub.stats());
        }
    });
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stats": state.hub.stats(),
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let limit = state.config.limits.max_frame_size;
    ws.max_message_size(limit.saturating_mul(UPGRADE_SIZE_FACTOR))
        .on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

/// Drive one upgraded connection to completion.
async fn handle_websocket(socket: WebSocket, remote: SocketAddr, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    debug!(remote = %remote, "WebSocket connected");

    let (reader, writer) = websocket::split(
        socket,
        Some(remote),
        state.config.limits.max_frame_size,
    );

    match accept(reader, writer, &state.session).await {
        Ok(reason) => {
            metrics::record_termination(reason);
            debug!(remote = %remote, reason = reason.as_str(), "WebSocket disconnected");
        }
        Err(e) => {
            metrics::record_handshake_failure(&e);
        }
    }
}

/// Internal endpoint errors.
#[derive(Debug, Error)]
pub enum InternalApiError {
    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Internal API is disabled")]
    Disabled,
}

impl IntoResponse for InternalApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Disabled => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), InternalApiError> {
    let expected = state
        .config
        .publish
        .token
        .as_deref()
        .ok_or(InternalApiError::Disabled)?;

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token_matches(token, expected) => Ok(()),
        _ => Err(InternalApiError::Unauthorized),
    }
}

/// Compare bearer tokens without an early exit on the first differing byte.
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Who a published event goes to.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PublishTarget {
    Channel {
        channel: String,
        #[serde(default)]
        exclude: Option<Uuid>,
    },
    User {
        user: Uuid,
    },
    Members {
        members: Vec<Uuid>,
        #[serde(default)]
        exclude: Option<Uuid>,
    },
}

impl PublishTarget {
    fn label(&self) -> &'static str {
        match self {
            Self::Channel { .. } => "channel",
            Self::User { .. } => "user",
            Self::Members { .. } => "members",
        }
    }
}

/// Body of a publish request.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub target: PublishTarget,
    pub event: Event,
}

/// Route an event from another service through the hub.
async fn publish_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PublishRequest>,
) -> Result<Json<DeliveryReport>, InternalApiError> {
    authorize(&state, &headers)?;

    let hub = &state.hub;
    let report = match &request.target {
        PublishTarget::Channel { channel, exclude } => {
            hub.broadcast_to_channel(channel, &request.event, *exclude)
                .await
        }
        PublishTarget::User { user } => hub.send_to_user(*user, &request.event).await,
        PublishTarget::Members { members, exclude } => {
            broadcast_to_members(hub, members, &request.event, *exclude).await
        }
    };

    metrics::record_published(request.target.label());
    debug!(
        route = request.target.label(),
        kind = %request.event.kind,
        delivered = report.delivered,
        dropped = report.dropped,
        "Published event"
    );

    Ok(Json(report))
}

async fn add_member_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((server_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, InternalApiError> {
    authorize(&state, &headers)?;
    state.directory.add_server_member(server_id, user_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_member_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((server_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, InternalApiError> {
    authorize(&state, &headers)?;
    state.directory.remove_server_member(server_id, user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Body of a conversation sync request.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationRequest {
    pub participants: Vec<Uuid>,
}

async fn set_conversation_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Json(request): Json<ConversationRequest>,
) -> Result<StatusCode, InternalApiError> {
    authorize(&state, &headers)?;
    state
        .directory
        .set_conversation(conversation_id, request.participants);
    Ok(StatusCode::NO_CONTENT)
}
