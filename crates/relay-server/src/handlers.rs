//! HTTP and WebSocket handlers for the relay server.
//!
//! This module authenticates requests, then hands them to the event router.

use crate::auth::KeyRegistry;
use crate::config::Config;
use crate::error::ApiError;
use crate::metrics::{self, SocketMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        DefaultBodyLimit, Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use relay_protocol::event::kinds;
use relay_protocol::{BrokerConfig, Event};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tenvis_relay_core::{
    inbound_channel, BrokerConfigStore, EventRouter, JsonFileMedium, ManagerError,
    MqttLinkFactory, SocketHub, TenantConnectionManager, TenantKey,
};
use tenvis_relay_transport::{SocketSink, WebSocketSink};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Routes events between sockets and broker links.
    pub router: Arc<EventRouter>,
    /// Tenant and admin keys.
    pub keys: Arc<KeyRegistry>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state from already built parts.
    #[must_use]
    pub fn new(router: Arc<EventRouter>, keys: Arc<KeyRegistry>, config: Config) -> Self {
        Self {
            router,
            keys,
            config,
        }
    }

    /// Build the full relay from configuration and start the inbound pump.
    ///
    /// # Errors
    ///
    /// Returns an error if the key file cannot be opened.
    pub async fn build(config: Config) -> Result<Arc<Self>> {
        let keys = KeyRegistry::open(&config.storage.key_file, config.master_key.clone())
            .await
            .with_context(|| {
                format!(
                    "Failed to open key file: {}",
                    config.storage.key_file.display()
                )
            })?;

        let medium = Arc::new(JsonFileMedium::new(&config.storage.broker_configs));
        let store = Arc::new(BrokerConfigStore::load(medium).await);

        let (inbound, rx) = inbound_channel(config.broker.inbound_capacity);
        let factory = Arc::new(MqttLinkFactory::new(config.broker.mqtt_settings()));
        let manager = Arc::new(TenantConnectionManager::new(store, factory, inbound));
        let hub = Arc::new(SocketHub::with_config(config.hub.hub_config()));

        let router = Arc::new(EventRouter::new(hub, manager));
        router.clone().spawn_inbound_pump(rx, |report| {
            metrics::record_event("mqtt", report.delivered);
        });

        Ok(Arc::new(Self::new(router, Arc::new(keys), config)))
    }

    fn tenant_from_headers(&self, headers: &HeaderMap) -> Result<TenantKey, ApiError> {
        let token = bearer_token(headers)?;
        self.keys.tenant(token).ok_or(ApiError::Forbidden)
    }

    fn require_admin(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = bearer_token(headers)?;
        if self.keys.is_valid_admin_key(token) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// Extract the token from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or(ApiError::MissingAuthorization)?
        .to_str()
        .map_err(|_| ApiError::InvalidTokenFormat)?;
    value
        .strip_prefix("Bearer ")
        .ok_or(ApiError::InvalidTokenFormat)
}

/// Parse a JSON body. Called only after the caller is authenticated.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let body_limit = state.config.limits.max_body_size;

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route(
            "/api/config-mqtt",
            get(get_config_handler).post(set_config_handler),
        )
        .route("/api/admin/reload-keys", post(reload_keys_handler))
        .route("/api/admin/broadcast", post(admin_broadcast_handler))
        .route("/api/:kind", post(submit_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = AppState::build(config.clone()).await?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_app(state.clone());

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Relay server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws?token=<key>", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down broker links");
    state.router.manager().shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.router.hub().stats();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "tenants": stats.tenant_count,
        "sockets": stats.socket_count,
    }))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(default)]
    token: String,
}

/// WebSocket upgrade handler.
///
/// Unknown tokens are refused before the upgrade.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(tenant) = state.keys.tenant(&params.token) else {
        warn!("WebSocket refused, unknown token");
        return ApiError::Forbidden.into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, tenant, state))
}

/// Handle an admitted WebSocket until it closes.
async fn handle_websocket(socket: WebSocket, tenant: TenantKey, state: Arc<AppState>) {
    let _metrics_guard = SocketMetricsGuard::new();

    let (sink, mut receiver) = WebSocketSink::split(socket);
    let sink = Arc::new(sink);
    let socket_id = sink.id().clone();

    let status = state.router.on_socket_admitted(&tenant, sink.clone()).await;
    metrics::set_active_tenants(state.router.hub().stats().tenant_count);
    debug!(tenant = %tenant, socket = %socket_id, status = %status, "WebSocket connected");

    let period = state.config.heartbeat_interval();
    let peer_timeout = state.config.heartbeat_timeout();
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut last_seen = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > peer_timeout {
                    debug!(socket = %socket_id, "Heartbeat timeout, peer silent");
                    break;
                }
                if let Err(e) = sink.ping().await {
                    debug!(socket = %socket_id, error = %e, "Heartbeat failed");
                    break;
                }
            }

            _ = sink.closed() => {
                debug!(socket = %socket_id, "Socket closed by relay");
                break;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket = %socket_id, "Received close frame");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Clients only listen; any frame, pongs included, proves liveness.
                        last_seen = tokio::time::Instant::now();
                    }
                    Some(Err(e)) => {
                        warn!(socket = %socket_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(socket = %socket_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    sink.mark_closed();
    state.router.on_socket_closed(&tenant, &socket_id).await;
    metrics::set_active_tenants(state.router.hub().stats().tenant_count);

    debug!(tenant = %tenant, socket = %socket_id, "WebSocket disconnected");
}

/// Submit an event of type `arrival`, `status`, `exception` or `control`.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !kinds::SUBMITTABLE.contains(&kind.as_str()) {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    let tenant = state.tenant_from_headers(&headers)?;
    let data: Value = parse_body(&body)?;

    let start = Instant::now();
    let report = state
        .router
        .submit_event(&tenant, Event::new(kind, data))
        .await;
    metrics::record_event("http", report.delivered);
    metrics::record_latency(start.elapsed().as_secs_f64());

    Ok(Json(json!({
        "status": "ok",
        "delivered": report.delivered,
        "published": report.published,
    }))
    .into_response())
}

/// Get the tenant's broker config, or `{}` if none.
async fn get_config_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant_from_headers(&headers)?;

    let body = match state.router.get_config(&tenant).await {
        Some(config) => {
            serde_json::to_value(config).map_err(|e| ApiError::Storage(e.to_string()))?
        }
        None => json!({}),
    };
    Ok(Json(body))
}

/// Replace the tenant's broker config and reconnect.
async fn set_config_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant_from_headers(&headers)?;
    let config: BrokerConfig = parse_body(&body)?;

    match state.router.set_config(&tenant, config.clone()).await {
        Ok(()) => {
            metrics::record_config_update("connected");
            Ok(Json(json!({ "status": "connected", "config": config })))
        }
        Err(ManagerError::Connect(detail)) => {
            metrics::record_config_update("error");
            Ok(Json(json!({ "status": "error", "detail": detail })))
        }
        Err(e @ ManagerError::Persist(_)) => {
            error!(tenant = %tenant, error = %e, "Broker config not persisted");
            metrics::record_config_update("persist_failed");
            Err(ApiError::Storage(e.to_string()))
        }
    }
}

/// Re-read the tenant key file.
async fn reload_keys_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    state.require_admin(&headers)?;

    let count = state.keys.reload().await.map_err(|e| {
        error!(path = %state.keys.path().display(), error = %e, "Key reload failed");
        ApiError::Storage(e.to_string())
    })?;
    Ok(Json(json!({ "status": "ok", "keys": count })))
}

/// Send an event to every socket of every tenant.
async fn admin_broadcast_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state.require_admin(&headers)?;
    let event: Event = parse_body(&body)?;

    let report = state.router.broadcast_all(event).await;
    metrics::record_event("admin", report.delivered);
    info!(delivered = report.delivered, failed = report.failed, "Admin broadcast");
    Ok(Json(json!({ "status": "ok", "delivered": report.delivered })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc")).unwrap(), "abc");
        assert!(matches!(
            bearer_token(&HeaderMap::new()),
            Err(ApiError::MissingAuthorization)
        ));
        assert!(matches!(
            bearer_token(&headers("Token abc")),
            Err(ApiError::InvalidTokenFormat)
        ));
    }

    #[test]
    fn test_parse_body() {
        let value: Value = parse_body(br#"{"robot":"r-1"}"#).unwrap();
        assert_eq!(value["robot"], "r-1");
        assert!(matches!(
            parse_body::<BrokerConfig>(b"not json"),
            Err(ApiError::InvalidBody(_))
        ));
    }
}
