//! `RelayServer` — Axum HTTP + WebSocket server.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response as AxumResponse};
use axum::routing::get;
use axum::Router;
use relay_core::{ContextFactory, ContextSlot, Dispatcher, RequestInfo};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::connection::connection_id;
use crate::health::{self, HealthResponse};
use crate::http::procedure_handler;
use crate::registry::ConnectionRegistry;
use crate::session::run_ws_session;
use crate::shutdown::Shutdown;

/// Shared state accessible from Axum handlers.
pub struct AppState<Ctx> {
    /// Open-connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// The dispatch engine.
    pub dispatcher: Arc<dyn Dispatcher<Ctx>>,
    /// Per-request / per-connection context factory.
    pub context_factory: Arc<dyn ContextFactory<Ctx>>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown signal.
    pub shutdown: Arc<Shutdown>,
    /// When the server started.
    pub start_time: Instant,
}

impl<Ctx> Clone for AppState<Ctx> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            dispatcher: Arc::clone(&self.dispatcher),
            context_factory: Arc::clone(&self.context_factory),
            config: Arc::clone(&self.config),
            shutdown: Arc::clone(&self.shutdown),
            start_time: self.start_time,
        }
    }
}

/// The relay server: both transports in front of one dispatch engine.
pub struct RelayServer<Ctx> {
    state: AppState<Ctx>,
}

impl<Ctx: Send + Sync + 'static> RelayServer<Ctx> {
    /// Create a new server.
    pub fn new(
        config: ServerConfig,
        dispatcher: Arc<dyn Dispatcher<Ctx>>,
        context_factory: Arc<dyn ContextFactory<Ctx>>,
    ) -> Self {
        Self {
            state: AppState {
                registry: Arc::new(ConnectionRegistry::new()),
                dispatcher,
                context_factory,
                config: Arc::new(config),
                shutdown: Arc::new(Shutdown::new()),
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes.
    ///
    /// Every route that is not `/health` or `/ws` falls through to the
    /// unary procedure gateway.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler::<Ctx>))
            .route("/ws", get(ws_handler::<Ctx>))
            .fallback(procedure_handler::<Ctx>)
            .with_state(self.state.clone())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
    }

    /// Get the connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Get the server configuration.
    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.state.config
    }

    /// Get the shutdown signal.
    pub fn shutdown(&self) -> &Arc<Shutdown> {
        &self.state.shutdown
    }

    /// Ask every connected client to reconnect (e.g. before a restart).
    pub async fn broadcast_reconnect(&self) {
        self.state.registry.broadcast_reconnect().await;
    }

    /// Serve until the shutdown signal fires.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        let token = self.state.shutdown.token();
        info!(addr = %listener.local_addr()?, "relay server listening");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    }
}

/// GET /health
async fn health_handler<Ctx: Send + Sync + 'static>(
    State(state): State<AppState<Ctx>>,
) -> Json<HealthResponse> {
    let connections = state.registry.count().await;
    Json(health::health_check(state.start_time, connections))
}

/// GET /ws — upgrade to the duplex transport.
///
/// Context creation is initiated here, during the upgrade phase, and
/// resolves after the duplex channel opens; early messages queue on the
/// slot (`ContextSlot`).
async fn ws_handler<Ctx: Send + Sync + 'static>(
    State(state): State<AppState<Ctx>>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> AxumResponse {
    if state.registry.count().await >= state.config.max_connections {
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let info = RequestInfo {
        method: "GET".into(),
        path: uri.path().to_owned(),
        query: uri.query().unwrap_or_default().to_owned(),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
    };
    let factory = Arc::clone(&state.context_factory);
    let ctx = ContextSlot::spawn(async move { factory.create_context(&info).await });

    let conn_id = connection_id();
    let dispatcher = Arc::clone(&state.dispatcher);
    let registry = Arc::clone(&state.registry);
    let config = Arc::clone(&state.config);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            run_ws_session(socket, conn_id, ctx, dispatcher, registry, config)
        })
}
