//! Tests for transport abstraction layer

use super::*;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_pipe_dial_accept() {
    let (listener, dialer) = pipe();

    let mut client = dialer.dial().await.unwrap();
    let mut server = listener.accept().await.unwrap();

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_channel_listener_close_unblocks_accept() {
    let (listener, sender) = ChannelListener::new("test");
    let listener = Arc::new(listener);

    let pending = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    listener.close();
    listener.close();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(TransportError::ListenerClosed)));
    assert!(matches!(
        listener.accept().await,
        Err(TransportError::ListenerClosed)
    ));
    assert!(sender.is_closed());
}

#[tokio::test]
async fn test_tcp_listener_accept_and_close() {
    let listener = Arc::new(TcpConnListener::bind("127.0.0.1:0").await.unwrap());
    let addr = listener.addr();

    let accept = {
        let listener = listener.clone();
        tokio::spawn(async move { listener.accept().await })
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut server = accept.await.unwrap().unwrap();

    server.write_all(b"pong").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    listener.close();
    assert!(matches!(
        listener.accept().await,
        Err(TransportError::ListenerClosed)
    ));
}

#[tokio::test]
async fn test_tcp_dialer() {
    let listener = TcpConnListener::bind("127.0.0.1:0").await.unwrap();
    let dialer = tcp_dialer(listener.addr().to_string());

    let (client, server) = tokio::join!(dialer(), listener.accept());
    let mut client = client.unwrap();
    let mut server = server.unwrap();

    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"x");
}

#[tokio::test]
async fn test_dial_unsupported_network() {
    let err = dial("udp", "127.0.0.1:1").await.err().unwrap();
    assert!(matches!(err, TransportError::UnsupportedNetwork(n) if n == "udp"));
}
