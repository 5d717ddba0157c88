//! Client side helpers for the CLI commands

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use exposer_control::{start_client, start_forward, Engine, Forwarder, NextRoute};
use exposer_proto::Attribute;
use exposer_transport::{BoxConnection, Listener};
use exposer_transport_websocket::http_to_ws_url;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper::header::{AUTHORIZATION, HOST};
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

/// Open a control connection to the daemon at `server`
pub async fn connect(server: &str) -> Result<BoxConnection> {
    let url = http_to_ws_url(server).context("Invalid server URL")?;
    debug!("Connecting to {}", url);
    exposer_transport_websocket::connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {}", server))
}

/// Authenticate, open `routes` and run until the connection ends
///
/// Returns an error carrying the reason the connection ended; Ctrl+C ends
/// it cleanly.
pub async fn run_routes(server: &str, key: &str, routes: Vec<NextRoute>) -> Result<()> {
    let conn = connect(server).await?;
    let engine = start_client(conn, key, routes);
    info!("Connected to {}", server);
    run_until_closed(engine).await
}

/// Forward through a standalone forward server until the connection ends
pub async fn run_direct_forward(
    server: &str,
    network: &str,
    address: &str,
    listener: Arc<dyn Listener>,
    forwarder: Forwarder,
) -> Result<()> {
    let conn = connect(server).await?;
    let engine = start_forward(conn, network, address, listener, forwarder);
    info!("Connected to forward server {}", server);
    run_until_closed(engine).await
}

async fn run_until_closed(engine: Engine) -> Result<()> {
    let reason = tokio::select! {
        reason = engine.wait() => reason,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, closing connection");
            engine.close();
            return Ok(());
        }
    };

    engine.close();
    Err(anyhow!(reason)).context("Connection to server ended")
}

/// Fetch the service table from `GET /api/services`
pub async fn list_services(server: &str, key: &str) -> Result<BTreeMap<String, Attribute>> {
    let url = Url::parse(server).context("Invalid server URL")?;
    let host = url.host_str().context("Server URL has no host")?.to_string();
    let port = url
        .port_or_known_default()
        .context("Server URL has no port")?;

    let stream = TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
    let conn: BoxConnection = match url.scheme() {
        "http" | "ws" => Box::new(stream),
        "https" | "wss" => Box::new(tls_connect(&host, stream).await?),
        other => bail!("Unsupported server scheme: {}", other),
    };

    let (mut sender, connection) = http1::handshake::<_, Empty<Bytes>>(TokioIo::new(conn))
        .await
        .context("HTTP handshake failed")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("API connection closed: {}", e);
        }
    });

    let path = format!("{}/api/services", url.path().trim_end_matches('/'));
    let request = Request::get(path)
        .header(HOST, format!("{}:{}", host, port))
        .header(AUTHORIZATION, key)
        .body(Empty::new())
        .context("Failed to build request")?;

    let response = sender
        .send_request(request)
        .await
        .context("Request failed")?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .context("Failed to read response")?
        .to_bytes();

    if !status.is_success() {
        bail!("Server answered {}: {}", status, String::from_utf8_lossy(&body));
    }
    serde_json::from_slice(&body).context("Invalid services response")
}

async fn tls_connect(
    host: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from(host.to_string()).context("Invalid server name")?;
    TlsConnector::from(Arc::new(config))
        .connect(name, stream)
        .await
        .context("TLS handshake failed")
}

/// Render the service table printed by `exposer ls`
pub fn format_services(services: &BTreeMap<String, Attribute>) -> String {
    let width = services.keys().map(|n| n.len()).max().unwrap_or(0).max(4);

    let mut out = format!("{:<width$}  {:<5}  {}\n", "NAME", "HTTP", "HOST");
    for (name, attr) in services {
        let host = if attr.http_host().is_empty() {
            "-"
        } else {
            attr.http_host()
        };
        out.push_str(&format!(
            "{:<width$}  {:<5}  {}\n",
            name,
            attr.is_http(),
            host
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_services() {
        let mut services = BTreeMap::new();
        services.insert("web".to_string(), Attribute::http("web.local"));
        services.insert("database".to_string(), Attribute::default());

        let table = format_services(&services);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "NAME      HTTP   HOST");
        assert_eq!(lines[1], "database  false  -");
        assert_eq!(lines[2], "web       true   web.local");
    }

    #[test]
    fn test_format_empty() {
        assert_eq!(format_services(&BTreeMap::new()), "NAME  HTTP   HOST\n");
    }
}
