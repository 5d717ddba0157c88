//! End-to-end tests of the control channel over in-memory pipes

use async_trait::async_trait;
use exposer_control::{
    serve, serve_connection, start_client, Engine, EngineError, Forwarder, Handler,
    HandshakeHandler, KeepaliveClient, NextRoute, ServerContext, Transition,
};
use exposer_mux::Role;
use exposer_proto::{
    Attribute, Handshake, Reply, CMD_AUTH, CMD_AUTH_REPLY, CMD_PING, CMD_PONG, CMD_ROUTE,
    CMD_ROUTE_REPLY,
};
use exposer_router::ServiceRegistry;
use exposer_transport::{pipe, BoxConnection, Dialer, Listener, PipeDialer, TcpConnListener};
use futures::FutureExt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

const KEY: &str = "test-key";
const WAIT: Duration = Duration::from_secs(5);

fn forwarder() -> Forwarder {
    Forwarder::new(Duration::from_millis(10))
}

fn context(registry: Arc<ServiceRegistry>) -> ServerContext {
    ServerContext::with_key(registry, KEY).with_forwarder(forwarder())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn start_server(ctx: ServerContext) -> PipeDialer {
    init_tracing();
    let (listener, dialer) = pipe();
    tokio::spawn(serve(Arc::new(listener), Arc::new(ctx)));
    dialer
}

/// Dialer whose every connection echoes what it receives
fn echo_dialer() -> Dialer {
    Arc::new(|| {
        async {
            let (near, mut far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match far.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if far.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok::<_, io::Error>(Box::new(near) as BoxConnection)
        }
        .boxed()
    })
}

fn quiet_keepalive() -> NextRoute {
    NextRoute::keepalive(KeepaliveClient::new(
        Duration::from_millis(20),
        Duration::from_secs(10),
    ))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn assert_echo(conn: &mut BoxConnection, payload: &[u8]) {
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, conn.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, payload);
}

async fn expose_echo(server: &PipeDialer, name: &str, attr: Attribute) -> Engine {
    start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![
            quiet_keepalive(),
            NextRoute::expose(name, attr, echo_dialer(), forwarder()),
        ],
    )
}

/// Stops answering pongs after `limit` of them
struct Halting {
    inner: KeepaliveClient,
    pongs: usize,
    limit: usize,
}

#[async_trait]
impl HandshakeHandler for Halting {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        if frame.command == CMD_PONG {
            self.pongs += 1;
            if self.pongs > self.limit {
                return Ok(Transition::Continue);
            }
        }
        self.inner.handle(engine, frame).await
    }

    fn installed(&mut self, engine: &Engine) {
        self.inner.installed(engine);
    }
}

/// Server that accepts the key and every route but never answers a ping
struct Mute;

#[async_trait]
impl HandshakeHandler for Mute {
    async fn handle(
        &mut self,
        engine: &Engine,
        frame: Handshake,
    ) -> Result<Transition, EngineError> {
        match frame.command.as_str() {
            CMD_AUTH => {
                engine.reply(CMD_AUTH_REPLY, &Reply::ok()).await?;
                let session = engine.multiplex(Role::Server).await?;
                loop {
                    let stream = session.accept().await?;
                    let child = Engine::with_parent(engine, Box::new(stream), Handler::custom(Mute));
                    tokio::spawn(async move { child.run().await });
                }
            }
            CMD_ROUTE => {
                engine.reply(CMD_ROUTE_REPLY, &Reply::ok()).await?;
                Ok(Transition::Continue)
            }
            _ => Ok(Transition::Continue),
        }
    }
}

#[tokio::test]
async fn test_expose_then_link() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry.clone()));

    let _exposer = expose_echo(&server, "echo", Attribute::http("echo.local")).await;
    wait_until(|| registry.get("echo").is_some_and(|s| s.is_ready())).await;

    let service = registry.get("echo").unwrap();
    wait_until(|| service.attribute().snapshot().is_http()).await;
    assert_eq!(service.attribute().snapshot().http_host(), "echo.local");

    // straight through the registry
    let mut direct = service.open().await.unwrap();
    assert_echo(&mut direct, b"through the registry").await;

    // through a linking client
    let (link_listener, link_dialer) = pipe();
    let linker = start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![NextRoute::link("echo", Arc::new(link_listener), forwarder())],
    );

    let mut first = link_dialer.dial().await.unwrap();
    let mut second = link_dialer.dial().await.unwrap();
    assert_echo(&mut first, b"hello").await;
    assert_echo(&mut second, b"world").await;
    assert_echo(&mut first, &vec![7u8; 32 * 1024]).await;
    assert!(!linker.is_shut_down());
}

#[tokio::test]
async fn test_service_removed_when_exposer_leaves() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry.clone()));

    let exposer = expose_echo(&server, "leaving", Attribute::default()).await;
    wait_until(|| registry.get("leaving").is_some()).await;

    exposer.close();
    wait_until(|| registry.get("leaving").is_none()).await;
}

#[tokio::test]
async fn test_duplicate_expose_refused() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry.clone()));

    let first = expose_echo(&server, "dup", Attribute::default()).await;
    wait_until(|| registry.get("dup").is_some()).await;

    let second = start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![NextRoute::expose(
            "dup",
            Attribute::default(),
            echo_dialer(),
            forwarder(),
        )],
    );

    let err = timeout(WAIT, second.wait()).await.unwrap();
    assert!(
        matches!(&err, EngineError::Rejected(msg) if msg.contains("already exists")),
        "unexpected error: {err}"
    );
    assert!(!first.is_shut_down());
    assert!(registry.get("dup").is_some());
}

#[tokio::test]
async fn test_forbidden_key() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry));

    let client = start_client(server.dial().await.unwrap(), "wrong", vec![quiet_keepalive()]);

    let err = timeout(WAIT, client.wait()).await.unwrap();
    assert!(
        matches!(&err, EngineError::Rejected(msg) if msg == "forbidden key"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_link_to_missing_service() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry));

    let (link_listener, _link_dialer) = pipe();
    let client = start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![NextRoute::link("nope", Arc::new(link_listener), forwarder())],
    );

    let err = timeout(WAIT, client.wait()).await.unwrap();
    assert!(
        matches!(&err, EngineError::Rejected(msg) if msg == r#"service "nope" not found"#),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn test_unknown_route_leaves_siblings_running() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry.clone()));

    let client = start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![
            quiet_keepalive(),
            NextRoute::expose("sibling", Attribute::default(), echo_dialer(), forwarder()),
            NextRoute::new(
                "teleport",
                Handler::custom(Halting {
                    inner: KeepaliveClient::default(),
                    pongs: 0,
                    limit: 0,
                }),
                CMD_PING,
                &(),
            ),
        ],
    );

    let err = timeout(WAIT, client.wait()).await.unwrap();
    assert!(
        matches!(&err, EngineError::Rejected(msg) if msg == r#""teleport": not supported type"#),
        "unexpected error: {err}"
    );

    wait_until(|| registry.get("sibling").is_some_and(|s| s.is_ready())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = registry.get("sibling").unwrap().open().await.unwrap();
    assert_echo(&mut conn, b"still here").await;
}

#[tokio::test]
async fn test_keepalive_holds_connection() {
    let registry = Arc::new(ServiceRegistry::new());
    let ctx = context(registry).with_keepalive_timeout(Duration::from_millis(100));
    let (client_conn, server_conn) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(Box::new(server_conn), Arc::new(ctx)));

    let client = start_client(
        Box::new(client_conn),
        KEY,
        vec![NextRoute::keepalive(KeepaliveClient::new(
            Duration::from_millis(30),
            Duration::from_millis(100),
        ))],
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!client.is_shut_down());
    assert!(!server.is_finished());
}

#[tokio::test]
async fn test_server_times_out_silent_client() {
    let registry = Arc::new(ServiceRegistry::new());
    let ctx = context(registry).with_keepalive_timeout(Duration::from_millis(60));
    let (client_conn, server_conn) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(Box::new(server_conn), Arc::new(ctx)));

    let client = start_client(
        Box::new(client_conn),
        KEY,
        vec![NextRoute::new(
            "keepalive",
            Handler::custom(Halting {
                inner: KeepaliveClient::new(Duration::from_millis(20), Duration::from_secs(10)),
                pongs: 0,
                limit: 2,
            }),
            CMD_PING,
            &(),
        )],
    );

    let server_err = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(
        matches!(server_err, EngineError::KeepaliveTimeout),
        "unexpected error: {server_err}"
    );

    // the physical connection was torn down under the client
    timeout(WAIT, client.wait()).await.unwrap();
}

#[tokio::test]
async fn test_disconnect_reason_survives_refused_route() {
    let registry = Arc::new(ServiceRegistry::new());
    let ctx = context(registry).with_keepalive_timeout(Duration::from_millis(60));
    let (client_conn, server_conn) = tokio::io::duplex(64 * 1024);
    let server = tokio::spawn(serve_connection(Box::new(server_conn), Arc::new(ctx)));

    let _client = start_client(
        Box::new(client_conn),
        KEY,
        vec![
            NextRoute::new(
                "teleport",
                Handler::custom(Halting {
                    inner: KeepaliveClient::default(),
                    pongs: 0,
                    limit: 0,
                }),
                CMD_PING,
                &(),
            ),
            NextRoute::new(
                "keepalive",
                Handler::custom(Halting {
                    inner: KeepaliveClient::new(Duration::from_millis(20), Duration::from_secs(10)),
                    pongs: 0,
                    limit: 2,
                }),
                CMD_PING,
                &(),
            ),
        ],
    );

    let server_err = timeout(WAIT, server).await.unwrap().unwrap();
    assert!(
        matches!(server_err, EngineError::KeepaliveTimeout),
        "unexpected error: {server_err}"
    );
}

#[tokio::test]
async fn test_client_times_out_silent_server() {
    let registry = Arc::new(ServiceRegistry::new());
    let ctx = context(registry).with_keepalive_timeout(Duration::from_secs(10));
    let (client_conn, server_conn) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_connection(Box::new(server_conn), Arc::new(ctx)));

    let client = start_client(
        Box::new(client_conn),
        KEY,
        vec![NextRoute::new(
            "keepalive",
            Handler::custom(Halting {
                inner: KeepaliveClient::new(Duration::from_millis(20), Duration::from_millis(100)),
                pongs: 0,
                limit: 2,
            }),
            CMD_PING,
            &(),
        )],
    );

    let err = timeout(WAIT, client.wait()).await.unwrap();
    assert!(
        matches!(err, EngineError::KeepaliveTimeout),
        "unexpected error: {err}"
    );
    assert_eq!(err.to_string(), "keepalive: timeout");
}

#[tokio::test]
async fn test_client_times_out_server_that_never_pongs() {
    init_tracing();
    let (client_conn, server_conn) = tokio::io::duplex(64 * 1024);
    let server = Engine::new(Box::new(server_conn), Handler::custom(Mute));
    tokio::spawn(async move { server.run().await });

    let client = start_client(
        Box::new(client_conn),
        KEY,
        vec![NextRoute::keepalive(KeepaliveClient::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
        ))],
    );

    let err = timeout(Duration::from_secs(2), client.wait())
        .await
        .expect("client keepalive never fired");
    assert!(
        matches!(err, EngineError::KeepaliveTimeout),
        "unexpected error: {err}"
    );
}

#[test]
#[should_panic(expected = "must be shorter")]
fn test_keepalive_interval_must_be_shorter_than_timeout() {
    KeepaliveClient::new(Duration::from_millis(30), Duration::from_millis(30));
}

async fn tcp_echo_server() -> String {
    let listener = TcpConnListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.addr().to_string();
    tokio::spawn(async move {
        while let Ok(mut conn) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = conn.read(&mut buf).await {
                    if n == 0 || conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_forward_to_tcp_address() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry));
    let target = tcp_echo_server().await;

    let (local_listener, local_dialer) = pipe();
    let client = start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![NextRoute::forward("tcp", target, Arc::new(local_listener), forwarder())],
    );

    let mut conn = local_dialer.dial().await.unwrap();
    assert_echo(&mut conn, b"over tcp").await;
    assert!(!client.is_shut_down());
}

#[tokio::test]
async fn test_forward_to_unreachable_address_refused() {
    let registry = Arc::new(ServiceRegistry::new());
    let server = start_server(context(registry));

    let closed = TcpConnListener::bind("127.0.0.1:0").await.unwrap();
    let target = closed.addr().to_string();
    drop(closed);

    let (local_listener, _local_dialer) = pipe();
    let client = start_client(
        server.dial().await.unwrap(),
        KEY,
        vec![NextRoute::forward("tcp", target, Arc::new(local_listener), forwarder())],
    );

    let err = timeout(WAIT, client.wait()).await.unwrap();
    assert!(matches!(err, EngineError::Rejected(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_client_on_dead_connection_reports_closed() {
    let (conn, peer) = tokio::io::duplex(64);
    drop(peer);

    let client = start_client(Box::new(conn), KEY, vec![quiet_keepalive()]);
    let err = timeout(WAIT, client.wait()).await.unwrap();
    assert!(matches!(err, EngineError::ConnectionClosed), "unexpected error: {err}");
}
