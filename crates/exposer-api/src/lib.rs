//! HTTP surface of the exposer daemon
//!
//! - `GET /api/services` lists registered services (requires the key)
//! - `/service/{name}/...` proxies HTTP requests into an exposed service
//! - `GET /` upgrades to a WebSocket that carries a control connection
//!
//! [`serve_control_only`] serves just the WebSocket endpoint.

pub mod error;
pub mod handlers;
pub mod middleware;

use axum::{
    middleware as axum_middleware,
    routing::{any, get},
    Router,
};
use exposer_router::ServiceRegistry;
use exposer_transport::ConnectionSender;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<ServiceRegistry>,
    pub key: String,
    /// Feeds upgraded WebSocket connections to the control channel
    pub control: ConnectionSender,
}

/// API server
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(registry: Arc<ServiceRegistry>, key: impl Into<String>, control: ConnectionSender) -> Self {
        Self {
            state: Arc::new(AppState {
                registry,
                key: key.into(),
                control,
            }),
        }
    }

    pub fn build_router(&self) -> Router {
        let api_router = Router::new()
            .route("/api/services", get(handlers::list_services))
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::require_key,
            ))
            .with_state(self.state.clone());

        let gateway_router = Router::new()
            .route("/service/{name}", any(handlers::proxy_root))
            .route("/service/{name}/{*path}", any(handlers::proxy_path))
            .with_state(self.state.clone());

        Router::new()
            .route("/", get(handlers::control_upgrade))
            .with_state(self.state.clone())
            .merge(api_router)
            .merge(gateway_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Serve on `listener` until the process ends
    pub async fn start(self, listener: TcpListener) -> std::io::Result<()> {
        info!("HTTP surface listening on {}", listener.local_addr()?);

        let router = self.build_router();
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

/// Serve only the WebSocket control endpoint on `listener`
pub async fn serve_control_only(listener: TcpListener, control: ConnectionSender) -> std::io::Result<()> {
    info!("Control endpoint listening on {}", listener.local_addr()?);

    let router = Router::new()
        .route("/", get(handlers::bare_upgrade))
        .with_state(control)
        .layer(TraceLayer::new_for_http());
    axum::serve(listener, router).await
}
