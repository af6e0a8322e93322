//! Error types for Switchyard
//!
//! This module defines the error taxonomy of the connection pipeline and the
//! SOCKS5 reply codes that listeners derive from it.

use crate::transport::relay::{ErrorClass, RelayError};
use std::io;
use thiserror::Error;

/// Errors produced while driving one inbound connection through the pipeline
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed handshake or request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credentials were missing or rejected
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Destination could not be determined
    #[error("Routing error: {0}")]
    Routing(String),

    /// Name lookup failed
    #[error("Resolution error: {name}: {reason}")]
    Resolution {
        /// Name that failed to resolve
        name: String,
        /// Reason reported by the lookup
        reason: String,
    },

    /// A rule explicitly denied the request
    #[error("Denied by ruleset: {0}")]
    RulesetDenial(String),

    /// Outbound connect failed
    #[error("Dial error: {0}")]
    Dial(#[source] io::Error),

    /// Mid-stream relay failure
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Invalid configuration or wiring
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error outside the relay phase
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Whether this error is an ordinary closure rather than a pipeline fault.
    ///
    /// Only relay errors tagged benign at the transport layer qualify.
    pub fn is_benign(&self) -> bool {
        match self {
            ProxyError::Relay(err) => err.class().is_benign(),
            ProxyError::Io(err) => ErrorClass::of(err).is_benign(),
            _ => false,
        }
    }
}

/// Result alias for pipeline operations
pub type Result<T, E = ProxyError> = std::result::Result<T, E>;

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Unknown reply code
    #[error("Unknown reply code: {0}")]
    UnknownReplyCode(u8),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            other => Err(Socks5Error::UnknownReplyCode(other)),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    /// Map a dial failure to the nearest reply code.
    ///
    /// The error kind decides when the platform reports one; otherwise the
    /// message text is consulted for the three phrases clients care about.
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => return Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable => return Socks5ReplyCode::NetworkUnreachable,
            io::ErrorKind::HostUnreachable
            | io::ErrorKind::TimedOut
            | io::ErrorKind::AddrNotAvailable => return Socks5ReplyCode::HostUnreachable,
            _ => {}
        }

        let message = err.to_string().to_lowercase();
        if message.contains("connection refused") {
            Socks5ReplyCode::ConnectionRefused
        } else if message.contains("network is unreachable") {
            Socks5ReplyCode::NetworkUnreachable
        } else {
            Socks5ReplyCode::HostUnreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::relay::BenignKind;

    #[test]
    fn test_socks5_reply_code_round_trips_through_u8() {
        for byte in 0x00..=0x08u8 {
            let code = Socks5ReplyCode::try_from(byte).unwrap();
            assert_eq!(u8::from(code), byte);
        }
    }

    #[test]
    fn test_socks5_reply_code_from_u8_invalid() {
        assert!(Socks5ReplyCode::try_from(0xFF).is_err());
        assert!(Socks5ReplyCode::try_from(0x09).is_err());
    }

    #[test]
    fn test_reply_code_from_error_kind() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );

        let err = io::Error::new(io::ErrorKind::NetworkUnreachable, "no route");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::NetworkUnreachable
        );

        let err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::HostUnreachable
        );
    }

    #[test]
    fn test_reply_code_from_error_text() {
        let err = io::Error::new(io::ErrorKind::Other, "dial tcp: Connection refused");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::ConnectionRefused
        );

        let err = io::Error::new(io::ErrorKind::Other, "connect: network is unreachable");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::NetworkUnreachable
        );

        let err = io::Error::new(io::ErrorKind::Other, "something else");
        assert_eq!(
            Socks5ReplyCode::from(&err),
            Socks5ReplyCode::HostUnreachable
        );
    }

    #[test]
    fn test_proxy_error_display() {
        let err = ProxyError::Protocol("bad version".to_string());
        assert_eq!(format!("{}", err), "Protocol error: bad version");

        let err = ProxyError::Resolution {
            name: "nowhere.invalid".to_string(),
            reason: "no addresses".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Resolution error: nowhere.invalid: no addresses"
        );

        let err = ProxyError::RulesetDenial("10.0.0.0/8".to_string());
        assert_eq!(format!("{}", err), "Denied by ruleset: 10.0.0.0/8");
    }

    #[test]
    fn test_is_benign_only_for_tagged_relay_errors() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let err = ProxyError::Relay(RelayError::new(reset));
        assert!(err.is_benign());
        assert!(matches!(
            ErrorClass::of(&io::Error::from(io::ErrorKind::ConnectionReset)),
            ErrorClass::Benign(BenignKind::Reset)
        ));

        let fatal = io::Error::new(io::ErrorKind::InvalidData, "garbage");
        let err = ProxyError::Relay(RelayError::new(fatal));
        assert!(!err.is_benign());

        let err = ProxyError::Dial(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(!err.is_benign());
    }
}
