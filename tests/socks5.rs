//! SOCKS5 servers driven over real sockets

mod common;

use common::socks5_mock::*;
use common::{refused_addr, spawn_echo_server, TestConfigBuilder, ECHO_HOST};
use std::time::Duration;
use switchyard::config::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn greet(proxy: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&greeting_no_auth()).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);
    stream
}

async fn assert_echo(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut back = vec![0u8; payload.len()];
    stream.read_exact(&mut back).await.unwrap();
    assert_eq!(back, payload);
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_connect_ipv4_relays_bytes() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .start()
        .await;

    let mut stream = greet(proxy.addr("socks")).await;
    stream
        .write_all(&connect_ipv4([127, 0, 0, 1], echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x00);

    assert_echo(&mut stream, b"hello through socks").await;
}

#[tokio::test]
async fn test_connect_domain_uses_static_hosts() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .start()
        .await;

    let mut stream = greet(proxy.addr("socks")).await;
    stream
        .write_all(&connect_domain(ECHO_HOST, echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x00);

    assert_echo(&mut stream, b"named destination").await;
}

#[tokio::test]
async fn test_async_socks5_client() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .start()
        .await;

    let mut stream = TcpStream::connect(proxy.addr("socks")).await.unwrap();
    async_socks5::connect(&mut stream, echo, None).await.unwrap();

    assert_echo(&mut stream, b"third-party client").await;
}

#[tokio::test]
async fn test_denied_cidr_gets_rule_failure() {
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .deny_destination("10.0.0.0/8")
        .start()
        .await;

    let mut stream = greet(proxy.addr("socks")).await;
    stream
        .write_all(&connect_ipv4([10, 1, 2, 3], 80))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x02);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_loopback_to_own_listener_denied() {
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .start()
        .await;
    let own = proxy.addr("socks");

    let mut stream = greet(own).await;
    stream
        .write_all(&connect_domain("localhost", own.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x02);
}

#[tokio::test]
async fn test_refused_dial_reports_connection_refused() {
    let target = refused_addr().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .start()
        .await;

    let mut stream = greet(proxy.addr("socks")).await;
    stream
        .write_all(&connect_ipv4([127, 0, 0, 1], target.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x05);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_password_auth() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .with_auth()
        .user("alice", "secret")
        .start()
        .await;

    let mut stream = TcpStream::connect(proxy.addr("socks")).await.unwrap();
    stream.write_all(&greeting_password()).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    stream
        .write_all(&credentials("alice", "secret"))
        .await
        .unwrap();
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    stream
        .write_all(&connect_ipv4([127, 0, 0, 1], echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x00);
    assert_echo(&mut stream, b"authenticated").await;
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .with_auth()
        .user("alice", "secret")
        .start()
        .await;

    let mut stream = TcpStream::connect(proxy.addr("socks")).await.unwrap();
    stream.write_all(&greeting_password()).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();

    stream
        .write_all(&credentials("alice", "guess"))
        .await
        .unwrap();
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await.unwrap();
    assert_eq!(status[0], 0x01);
    assert_ne!(status[1], 0x00);
    assert_closed(&mut stream).await;
}

#[tokio::test]
async fn test_auth_required_refuses_no_auth_method() {
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .with_auth()
        .user("alice", "secret")
        .start()
        .await;

    let mut stream = TcpStream::connect(proxy.addr("socks")).await.unwrap();
    stream.write_all(&greeting_no_auth()).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);
}

#[tokio::test]
async fn test_queued_dispatch_serves_many_clients() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .with_dispatch(2, 2)
        .start()
        .await;

    let mut clients = Vec::new();
    for i in 0..3u8 {
        let addr = proxy.addr("socks");
        clients.push(tokio::spawn(async move {
            let mut stream = greet(addr).await;
            stream
                .write_all(&connect_ipv4([127, 0, 0, 1], echo.port()))
                .await
                .unwrap();
            assert_eq!(read_reply(&mut stream).await, 0x00);
            assert_echo(&mut stream, &[i; 32]).await;
        }));
    }
    for client in clients {
        client.await.unwrap();
    }
}

#[tokio::test]
async fn test_open_tunnel_leaves_worker_free() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .with_dispatch(1, 1)
        .start()
        .await;

    // Hold more tunnels open than there are workers and queue slots.
    let mut tunnels = Vec::new();
    for i in 0..3u8 {
        let mut stream = greet(proxy.addr("socks")).await;
        stream
            .write_all(&connect_ipv4([127, 0, 0, 1], echo.port()))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(3), read_reply(&mut stream))
            .await
            .unwrap();
        assert_eq!(reply, 0x00);
        assert_echo(&mut stream, &[i; 8]).await;
        tunnels.push(stream);
    }

    for (i, stream) in tunnels.iter_mut().enumerate() {
        assert_echo(stream, &[i as u8 + 100; 8]).await;
    }
}

#[tokio::test]
async fn test_idle_sockets_cannot_pin_admission() {
    let echo = spawn_echo_server().await;
    let proxy = TestConfigBuilder::new()
        .server("socks", Protocol::Socks5)
        .with_dispatch(1, 1)
        .with_handshake_timeout(1)
        .start()
        .await;

    let mut idle = Vec::new();
    for _ in 0..2 {
        idle.push(TcpStream::connect(proxy.addr("socks")).await.unwrap());
    }

    let mut stream = tokio::time::timeout(Duration::from_secs(5), greet(proxy.addr("socks")))
        .await
        .unwrap();
    stream
        .write_all(&connect_ipv4([127, 0, 0, 1], echo.port()))
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x00);
    assert_echo(&mut stream, b"admitted").await;

    for mut socket in idle {
        assert_closed(&mut socket).await;
    }
}
