//! # Switchyard - Multi-protocol Forward Proxy
//!
//! Switchyard accepts client connections over several wire protocols and
//! drives each one through the same pipeline before relaying bytes to the
//! destination.
//!
//! ## Features
//!
//! - **SOCKS5**: RFC 1928 CONNECT with optional RFC 1929 username/password
//! - **HTTP proxy**: `CONNECT` tunnels and absolute-URI plain requests
//! - **Forwarding**: a fixed port relayed to a fixed destination, TCP or UDP
//! - **Ruleset**: CIDR allow/deny rules behind a guard that stops clients
//!   from looping back into the proxy's own listeners
//! - **Resolver**: static hosts, LRU+TTL cache and coalesced lookups
//! - **Queued dispatch**: optional bounded worker pool per server
//!
//! ## Usage
//!
//! ```rust,ignore
//! use switchyard::config::load_config;
//! use switchyard::server::run_server;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("switchyard.toml")?;
//!     run_server(config, CancellationToken::new()).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener (handshake) -> Director: route -> resolve -> ruleset -> Connector -> Target
//!                 ^                                                               |
//!                 +------------------------ ReplySink <---------------------------+
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod config;
pub mod connector;
pub mod director;
pub mod error;
pub mod helper;
pub mod listener;
pub mod resolver;
pub mod router;
pub mod ruleset;
pub mod server;
pub mod transport;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use director::{Director, Dispatcher};
pub use error::{ProxyError, Socks5ReplyCode};
pub use server::{run_server, Server};

/// Version of the Switchyard library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
