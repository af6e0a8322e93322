//! SOCKS5 request parsing

use super::consts::*;
use crate::error::{ProxyError, Result, Socks5ReplyCode};
use crate::transport::Address;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Requested command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP CONNECT
    Connect,
    /// TCP BIND
    Bind,
    /// UDP ASSOCIATE
    UdpAssociate,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Some(Command::Connect),
            SOCKS5_CMD_TCP_BIND => Some(Command::Bind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "CONNECT"),
            Command::Bind => write!(f, "BIND"),
            Command::UdpAssociate => write!(f, "UDP ASSOCIATE"),
        }
    }
}

/// A request the listener cannot serve, with the reply it deserves
#[derive(Debug)]
pub struct Rejection {
    /// Reply code to send before closing
    pub code: Socks5ReplyCode,
    /// Error to log
    pub error: ProxyError,
}

/// Parse a SOCKS5 request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// The outer error is a transport or framing failure with no reply
/// possible; the inner one is a well-formed request that must be refused.
pub async fn read_request<S>(
    stream: &mut S,
) -> Result<std::result::Result<(Command, Address, u16), Rejection>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    let version = header[0];
    let cmd_byte = header[1];
    let addr_type = header[3];

    if version != SOCKS5_VERSION {
        return Err(ProxyError::Protocol(format!(
            "Unsupported SOCKS version in command: {}",
            version
        )));
    }

    let address = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Address::Ipv4(Ipv4Addr::from(addr))
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let domain_len = len[0] as usize;
            if domain_len == 0 || domain_len > MAX_DOMAIN_LEN {
                return Err(ProxyError::Protocol(format!(
                    "Invalid domain length: {}",
                    domain_len
                )));
            }

            let mut domain = vec![0u8; domain_len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| ProxyError::Protocol("Invalid UTF-8 in domain name".to_string()))?;
            Address::Domain(domain)
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Address::Ipv6(Ipv6Addr::from(addr))
        }
        other => {
            return Ok(Err(Rejection {
                code: Socks5ReplyCode::AddressTypeNotSupported,
                error: ProxyError::Protocol(format!("Unsupported address type: {}", other)),
            }));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    let port = u16::from_be_bytes(port);

    match Command::from_byte(cmd_byte) {
        Some(Command::Connect) => Ok(Ok((Command::Connect, address, port))),
        Some(command) => Ok(Err(Rejection {
            code: Socks5ReplyCode::CommandNotSupported,
            error: ProxyError::Protocol(format!("{} is not supported", command)),
        })),
        None => Ok(Err(Rejection {
            code: Socks5ReplyCode::CommandNotSupported,
            error: ProxyError::Protocol(format!("Unknown command: {}", cmd_byte)),
        })),
    }
}
