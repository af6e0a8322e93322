//! Helper utilities for Switchyard
//!
//! This module provides common constants and small functions used throughout
//! the application.

use std::time::Duration;

/// Default buffer size for IO operations
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default outbound dial timeout in seconds
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 10;

/// Default limit on a client's protocol handshake in seconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

/// Default idle timeout for forwarded UDP sessions in seconds
pub const DEFAULT_UDP_IDLE_TIMEOUT_SECS: u64 = 60;

/// Default resolver cache TTL in seconds
pub const DEFAULT_RESOLVER_TTL_SECS: u64 = 300;

/// Default resolver cache capacity
pub const DEFAULT_RESOLVER_CAPACITY: usize = 1024;

/// Maximum UDP datagram size
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Parse duration from seconds
pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
