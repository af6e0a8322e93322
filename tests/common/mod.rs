//! Test utilities for Switchyard integration tests
//!
//! Starts real servers on ephemeral ports and provides small origins for
//! them to reach.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use switchyard::config::{
    Config, DispatchConfig, ListenNetwork, Protocol, RuleAction, RuleConfig, RuleTarget,
    ServerConfig,
};
use switchyard::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Host name the test resolver maps to 127.0.0.1
pub const ECHO_HOST: &str = "echo.test";

/// A running set of servers, stopped on drop
pub struct TestProxy {
    addrs: HashMap<String, SocketAddr>,
    ctx: CancellationToken,
}

impl TestProxy {
    /// Bound address of the server called `name`
    pub fn addr(&self, name: &str) -> SocketAddr {
        self.addrs[name]
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// Test configuration builder
pub struct TestConfigBuilder {
    config: Config,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        let mut config = Config::default();
        config
            .resolver
            .hosts
            .insert(ECHO_HOST.to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        TestConfigBuilder { config }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a server on 127.0.0.1 with an OS-assigned port
    pub fn server(mut self, name: &str, protocol: Protocol) -> Self {
        let server = ServerConfig::new(name, protocol, IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        self.config.servers.push(server);
        self
    }

    /// Add a forward server relaying to `target`
    pub fn forward(mut self, name: &str, network: ListenNetwork, target: SocketAddr) -> Self {
        let mut server =
            ServerConfig::new(name, Protocol::Forward, IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        server.network = network;
        server.forward_to = Some(target.to_string());
        self.config.servers.push(server);
        self
    }

    /// Require credentials on the most recently added server
    pub fn with_auth(mut self) -> Self {
        if let Some(server) = self.config.servers.last_mut() {
            server.auth = true;
        }
        self
    }

    /// Queue the most recently added server behind a worker pool
    pub fn with_dispatch(mut self, workers: usize, queue: usize) -> Self {
        if let Some(server) = self.config.servers.last_mut() {
            server.dispatch = Some(DispatchConfig { workers, queue });
        }
        self
    }

    /// Limit the handshake of the most recently added server
    pub fn with_handshake_timeout(mut self, secs: u64) -> Self {
        if let Some(server) = self.config.servers.last_mut() {
            server.handshake_timeout_secs = secs;
        }
        self
    }

    /// Add a user
    pub fn user(mut self, username: &str, password: &str) -> Self {
        self.config
            .users
            .insert(username.to_string(), password.to_string());
        self
    }

    /// Deny destinations inside `cidr`
    pub fn deny_destination(mut self, cidr: &str) -> Self {
        self.config.rules.push(RuleConfig {
            action: RuleAction::Deny,
            target: RuleTarget::Destination,
            cidrs: vec![cidr.parse().unwrap()],
        });
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }

    /// Bind and start every server
    pub async fn start(self) -> TestProxy {
        let config = self.build();
        let server = Server::bind(&config).await.unwrap();
        let addrs = config
            .servers
            .iter()
            .map(|s| (s.name.clone(), server.local_addr(&s.name).unwrap()))
            .collect();

        let ctx = CancellationToken::new();
        tokio::spawn(server.run(ctx.clone()));
        TestProxy { addrs, ctx }
    }
}

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// TCP server echoing every byte back, for any number of clients
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// UDP socket echoing every datagram back to its sender
pub async fn spawn_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });
    addr
}

/// HTTP origin answering every request with its own request line as body
pub async fn spawn_http_origin() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let head = read_http_head(&mut stream).await;
                let line = head.lines().next().unwrap_or_default().to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nX-Origin: yes\r\n\r\n{}",
                    line.len(),
                    line
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

/// An address nothing listens on
pub async fn refused_addr() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    drop(listener);
    addr
}

/// Read up to and including the blank line ending an HTTP head
pub async fn read_http_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Raw SOCKS5 client messages
pub mod socks5_mock {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    /// No-auth method selection
    pub fn greeting_no_auth() -> Vec<u8> {
        vec![0x05, 0x01, 0x00]
    }

    /// Username/password method selection
    pub fn greeting_password() -> Vec<u8> {
        vec![0x05, 0x01, 0x02]
    }

    /// RFC 1929 credentials
    pub fn credentials(username: &str, password: &str) -> Vec<u8> {
        let mut msg = vec![0x01, username.len() as u8];
        msg.extend_from_slice(username.as_bytes());
        msg.push(password.len() as u8);
        msg.extend_from_slice(password.as_bytes());
        msg
    }

    /// CONNECT to an IPv4 address
    pub fn connect_ipv4(ip: [u8; 4], port: u16) -> Vec<u8> {
        let mut cmd = vec![0x05, 0x01, 0x00, 0x01];
        cmd.extend_from_slice(&ip);
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// CONNECT to a domain name
    pub fn connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }

    /// Read one reply and return its REP byte
    pub async fn read_reply(stream: &mut TcpStream) -> u8 {
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.unwrap();
        let rest = match head[3] {
            0x01 => 4 + 2,
            0x04 => 16 + 2,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                len[0] as usize + 2
            }
            other => panic!("unexpected address type {}", other),
        };
        let mut tail = vec![0u8; rest];
        stream.read_exact(&mut tail).await.unwrap();
        head[1]
    }
}
