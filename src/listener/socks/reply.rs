//! SOCKS5 reply encoding

use super::consts::*;
use crate::error::{ProxyError, Result, Socks5ReplyCode};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encode a reply
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// IPv4-mapped IPv6 addresses are sent as IPv4. A success without a bound
/// address cannot name an address type and is downgraded to
/// `AddressTypeNotSupported`; failures without one carry `0.0.0.0:0`.
pub fn encode_reply(code: Socks5ReplyCode, bound: Option<SocketAddr>) -> Vec<u8> {
    let (code, bound) = match bound {
        Some(addr) => (code, addr),
        None => {
            let code = if code == Socks5ReplyCode::Succeeded {
                Socks5ReplyCode::AddressTypeNotSupported
            } else {
                code
            };
            (code, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        }
    };

    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[SOCKS5_VERSION, code.into(), SOCKS5_RESERVED]);

    match bound.ip() {
        IpAddr::V4(ip) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => {
                reply.push(SOCKS5_ADDR_TYPE_IPV4);
                reply.extend_from_slice(&v4.octets());
            }
            None => {
                reply.push(SOCKS5_ADDR_TYPE_IPV6);
                reply.extend_from_slice(&ip.octets());
            }
        },
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    reply
}

/// Write a reply and flush it
pub async fn send_reply<S>(stream: &mut S, code: Socks5ReplyCode, bound: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&encode_reply(code, bound)).await?;
    stream.flush().await?;
    Ok(())
}

/// Decode a reply with an IP bound address, as a client would
pub fn decode_reply(bytes: &[u8]) -> Result<(Socks5ReplyCode, SocketAddr)> {
    let malformed = || ProxyError::Protocol("Malformed SOCKS5 reply".to_string());
    if bytes.len() < 4 || bytes[0] != SOCKS5_VERSION {
        return Err(malformed());
    }
    let code = Socks5ReplyCode::try_from(bytes[1]).map_err(|e| ProxyError::Protocol(e.to_string()))?;

    let (ip, rest) = match bytes[3] {
        SOCKS5_ADDR_TYPE_IPV4 if bytes.len() >= 10 => {
            let octets: [u8; 4] = bytes[4..8].try_into().map_err(|_| malformed())?;
            (IpAddr::V4(Ipv4Addr::from(octets)), &bytes[8..])
        }
        SOCKS5_ADDR_TYPE_IPV6 if bytes.len() >= 22 => {
            let octets: [u8; 16] = bytes[4..20].try_into().map_err(|_| malformed())?;
            (IpAddr::V6(Ipv6Addr::from(octets)), &bytes[20..])
        }
        _ => return Err(malformed()),
    };
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Ok((code, SocketAddr::new(ip, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_ipv4_decodes_to_same_address() {
        let bound: SocketAddr = "192.168.1.1:8080".parse().unwrap();
        let reply = encode_reply(Socks5ReplyCode::Succeeded, Some(bound));
        assert_eq!(
            reply,
            vec![5, 0, 0, 1, 192, 168, 1, 1, 0x1F, 0x90]
        );
        assert_eq!(
            decode_reply(&reply).unwrap(),
            (Socks5ReplyCode::Succeeded, bound)
        );
    }

    #[test]
    fn test_ipv6_reply() {
        let bound: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let reply = encode_reply(Socks5ReplyCode::Succeeded, Some(bound));
        assert_eq!(reply[3], SOCKS5_ADDR_TYPE_IPV6);
        assert_eq!(reply.len(), 3 + 1 + 16 + 2);
        assert_eq!(decode_reply(&reply).unwrap().1, bound);
    }

    #[test]
    fn test_mapped_ipv6_sent_as_ipv4() {
        let bound = SocketAddr::new(
            IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped()),
            9090,
        );
        let reply = encode_reply(Socks5ReplyCode::Succeeded, Some(bound));
        assert_eq!(reply[3], SOCKS5_ADDR_TYPE_IPV4);
        assert_eq!(&reply[4..8], &[10, 0, 0, 1]);
    }

    #[test]
    fn test_success_without_address_downgraded() {
        let reply = encode_reply(Socks5ReplyCode::Succeeded, None);
        assert_eq!(reply[1], u8::from(Socks5ReplyCode::AddressTypeNotSupported));
    }

    #[test]
    fn test_failure_carries_zero_address() {
        let reply = encode_reply(Socks5ReplyCode::ConnectionNotAllowed, None);
        assert_eq!(reply, vec![5, 2, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_send_reply() {
        let mut buffer = Vec::new();
        send_reply(&mut buffer, Socks5ReplyCode::ConnectionRefused, None)
            .await
            .unwrap();
        assert_eq!(buffer[1], 0x05);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_reply(&[5, 0]).is_err());
        assert!(decode_reply(&[4, 0, 0, 1, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(decode_reply(&[5, 0, 0, 3, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
