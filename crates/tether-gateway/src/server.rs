//! HTTP and WebSocket surface
//!
//! - `GET /health`
//! - `GET /ws?connectionId=<id>`: client socket
//! - `POST /auth`: deliver a token to a waiting connection
//! - `POST /auth/tokens`: mint a token for a user

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use tether_core::config::TetherConfig;
use tether_core::{AccountStore, CreditRate, ProviderRouter, UsageMeter};

use crate::auth::AuthBridge;
use crate::connection::serve_socket;
use crate::error::{GatewayError, GatewayResult};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::protocol::{
    DeliverTokenBody, DeliverTokenResponse, HealthResponse, MintTokenBody, MintedToken,
};
use crate::registry::{ConnectionRegistry, normalize_connection_id};

/// Everything the handlers share
pub struct GatewayState {
    pub registry: Arc<ConnectionRegistry>,
    pub bridge: Arc<AuthBridge>,
    pub orchestrator: Arc<Orchestrator>,
    pub version: String,
}

impl GatewayState {
    pub fn new(
        config: &TetherConfig,
        router: ProviderRouter,
        store: Arc<dyn AccountStore>,
    ) -> Arc<Self> {
        let gateway = &config.gateway;
        let registry = Arc::new(ConnectionRegistry::new(
            gateway.token_ttl(),
            gateway.closed_retention(),
        ));
        let bridge = Arc::new(AuthBridge::new(
            registry.clone(),
            store.clone(),
            gateway.token_ttl(),
            gateway.control_token.clone(),
        ));
        let meter = Arc::new(UsageMeter::new(
            store,
            CreditRate::new(config.billing.credits_per_1k_tokens),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(router),
            meter,
            registry.clone(),
            OrchestratorConfig::from_gateway(gateway),
        ));
        Arc::new(Self {
            registry,
            bridge,
            orchestrator,
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Sweep expired tokens and stale connections once.
    pub fn run_maintenance(&self) {
        let tokens = self.bridge.sweep_expired();
        let (closed, removed) = self.registry.evict_stale();
        debug!(
            tokens = tokens,
            closed = closed,
            removed = removed,
            "Maintenance sweep"
        );
    }
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_upgrade_handler))
        .route("/auth", post(deliver_token_handler))
        .route("/auth/tokens", post(mint_token_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct GatewayServer {
    bind: String,
    port: u16,
    sweep_interval: std::time::Duration,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    pub fn new(
        config: &TetherConfig,
        router: ProviderRouter,
        store: Arc<dyn AccountStore>,
    ) -> Self {
        Self {
            bind: config.gateway.bind.clone(),
            port: config.gateway.port,
            sweep_interval: config.gateway.sweep_interval(),
            state: GatewayState::new(config, router, store),
        }
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Bind the configured address. The only fatal error of the gateway.
    pub async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind((self.bind.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", self.bind, self.port))
    }

    /// Serve until `shutdown` is cancelled, then close every connection.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        info!(
            "tether gateway v{} listening on {} (providers: {})",
            self.state.version,
            addr,
            self.state.orchestrator.router().names().join(", ")
        );

        let maintenance_state = self.state.clone();
        let maintenance_stop = shutdown.clone();
        let sweep_interval = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = maintenance_stop.cancelled() => break,
                    _ = interval.tick() => maintenance_state.run_maintenance(),
                }
            }
        });

        let app = build_router(self.state.clone());
        let stop = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .context("Gateway server error")?;

        let closed = self.state.registry.close_all();
        info!("Gateway stopped, {} connections closed", closed);
        Ok(())
    }
}

// ── Handlers ──

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: state.version.clone(),
        connections: state.registry.live_count(),
        providers: state.orchestrator.router().names(),
    })
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(rename = "connectionId")]
    connection_id: String,
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let connection_id = match normalize_connection_id(&params.connection_id) {
        Ok(id) => id,
        Err(err) => return err.into_response(),
    };
    ws.on_upgrade(move |socket| serve_socket(socket, connection_id, state))
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
}

async fn deliver_token_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<DeliverTokenBody>, JsonRejection>,
) -> GatewayResult<Json<DeliverTokenResponse>> {
    state.bridge.verify_control_token(authorization(&headers))?;
    let Json(body) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let user = state
        .bridge
        .deliver_token(&body.connection_id, &body.token, body.user_data)
        .await?;
    Ok(Json(DeliverTokenResponse {
        status: "delivered".to_string(),
        connection_id: body.connection_id.trim().to_string(),
        user_id: user.user_id,
    }))
}

async fn mint_token_handler(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Result<Json<MintTokenBody>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<MintedToken>)> {
    state.bridge.verify_control_token(authorization(&headers))?;
    let Json(body) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let minted = state.bridge.mint(&body.user_id)?;
    Ok((StatusCode::CREATED, Json(minted)))
}
