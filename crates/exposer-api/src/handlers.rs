//! Request handlers

use crate::{ApiError, AppState};
use axum::{
    body::Body,
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Request, State,
    },
    http::{header, HeaderValue, Uri},
    response::Response,
    Json,
};
use exposer_proto::Attribute;
use exposer_transport::ConnectionSender;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Header carrying the address of the original caller
pub const X_ORIGIN_IP: &str = "x-origin-ip";

/// List every registered service with its attributes
pub async fn list_services(State(state): State<Arc<AppState>>) -> Json<BTreeMap<String, Attribute>> {
    let services = state
        .registry
        .all()
        .into_iter()
        .map(|service| (service.name().to_string(), service.attribute().snapshot()))
        .collect();
    Json(services)
}

/// `/service/{name}`
pub async fn proxy_root(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy(&state, &name, "", request).await
}

/// `/service/{name}/{*path}`
pub async fn proxy_path(
    State(state): State<Arc<AppState>>,
    Path((name, path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy(&state, &name, &path, request).await
}

/// Send `request` over a fresh connection into the service, rewritten to `sub_path`
async fn proxy(
    state: &AppState,
    name: &str,
    sub_path: &str,
    request: Request,
) -> Result<Response, ApiError> {
    let service = state
        .registry
        .get(name)
        .ok_or_else(|| ApiError::ServiceNotFound(name.to_string()))?;

    let attr = service.attribute().snapshot();
    if !attr.is_http() {
        return Err(ApiError::NotHttpService(name.to_string()));
    }

    let conn = service.open().await.map_err(|e| {
        warn!(service = %name, "Failed to open service: {}", e);
        ApiError::BadGateway(e.to_string())
    })?;

    let (mut sender, connection) = http1::handshake::<_, Body>(TokioIo::new(conn))
        .await
        .map_err(|e| ApiError::BadGateway(format!("HTTP handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Gateway connection closed: {}", e);
        }
    });

    let origin = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let (mut parts, body) = request.into_parts();

    let path_and_query = match parts.uri.query() {
        Some(query) => format!("/{}?{}", sub_path, query),
        None => format!("/{}", sub_path),
    };
    parts.uri = path_and_query
        .parse::<Uri>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if !attr.http_host().is_empty() {
        let host = HeaderValue::from_str(attr.http_host())
            .map_err(|e| ApiError::BadGateway(format!("invalid service host: {}", e)))?;
        parts.headers.insert(header::HOST, host);
    }
    parts
        .headers
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    if let Some(ip) = origin.and_then(|ip| HeaderValue::from_str(&ip).ok()) {
        parts.headers.insert(X_ORIGIN_IP, ip);
    }

    debug!(service = %name, method = %parts.method, uri = %parts.uri, "Proxying request");
    let response = sender
        .send_request(Request::from_parts(parts, body))
        .await
        .map_err(|e| ApiError::BadGateway(format!("request failed: {}", e)))?;

    Ok(response.map(Body::new))
}

/// Hand an upgraded WebSocket to the control channel listener
pub async fn control_upgrade(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move { hand_off(socket, &state.control).await })
}

/// Same as [`control_upgrade`] for servers without the rest of the API
pub async fn bare_upgrade(State(control): State<ConnectionSender>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move { hand_off(socket, &control).await })
}

async fn hand_off(socket: WebSocket, control: &ConnectionSender) {
    let conn = exposer_transport_websocket::from_axum(socket);
    match control.send(conn).await {
        Ok(()) => info!("Control connection accepted"),
        Err(e) => warn!("Dropping control connection: {}", e),
    }
}
