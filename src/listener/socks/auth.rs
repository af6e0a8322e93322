//! Method negotiation and RFC 1929 username/password sub-negotiation

use super::consts::*;
use crate::auth::{Authentication, Authenticator};
use crate::error::{ProxyError, Result};
use crate::transport::Address;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }
}

/// Select the method the server requires, if the client offered it
fn select_auth_method(methods: &[u8], auth_required: bool) -> Option<AuthMethod> {
    let wanted = if auth_required {
        AuthMethod::Password
    } else {
        AuthMethod::None
    };
    methods.contains(&wanted.to_byte()).then_some(wanted)
}

/// Negotiate the method and, when required, authenticate the client
///
/// ```text
/// +----+----------+----------+      +----+--------+
/// |VER | NMETHODS | METHODS  |  ->  |VER | METHOD |
/// +----+----------+----------+      +----+--------+
/// | 1  |    1     | 1 to 255 |      | 1  |   1    |
/// +----+----------+----------+      +----+--------+
/// ```
pub async fn negotiate<S>(
    stream: &mut S,
    source: Address,
    authenticator: Option<&dyn Authenticator>,
) -> Result<AuthMethod>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let num_methods = buf[1];

    if version != SOCKS5_VERSION {
        return Err(ProxyError::Protocol(format!(
            "Unsupported SOCKS version: {}",
            version
        )));
    }

    if num_methods == 0 {
        return Err(ProxyError::Protocol(
            "No authentication methods provided".to_string(),
        ));
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    let selected = select_auth_method(&methods, authenticator.is_some());
    stream
        .write_all(&[
            SOCKS5_VERSION,
            selected
                .map(AuthMethod::to_byte)
                .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
        ])
        .await?;
    stream.flush().await?;

    match (selected, authenticator) {
        (None, _) => Err(ProxyError::Authentication(
            "No acceptable authentication method".to_string(),
        )),
        (Some(AuthMethod::Password), Some(authenticator)) => {
            authenticate_password(stream, source, authenticator).await?;
            Ok(AuthMethod::Password)
        }
        (Some(method), _) => Ok(method),
    }
}

/// Run the username/password sub-negotiation
///
/// ```text
/// +----+------+----------+------+----------+      +----+--------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |  ->  |VER | STATUS |
/// +----+------+----------+------+----------+      +----+--------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |      | 1  |   1    |
/// +----+------+----------+------+----------+      +----+--------+
/// ```
pub async fn authenticate_password<S>(
    stream: &mut S,
    source: Address,
    authenticator: &dyn Authenticator,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;

    let version = buf[0];
    let username_len = buf[1] as usize;

    if version != SOCKS5_AUTH_VERSION {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(ProxyError::Protocol(format!(
            "Invalid auth version: {}",
            version
        )));
    }

    if username_len == 0 {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(ProxyError::Protocol("Invalid username length: 0".to_string()));
    }

    let mut username = vec![0u8; username_len];
    stream.read_exact(&mut username).await?;

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut password = vec![0u8; len[0] as usize];
    stream.read_exact(&mut password).await?;

    let (Ok(username), Ok(password)) = (String::from_utf8(username), String::from_utf8(password))
    else {
        send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
        return Err(ProxyError::Authentication(
            "Credentials are not valid UTF-8".to_string(),
        ));
    };

    let auth = Authentication::basic(source, &username, &password);
    match authenticator.authenticate(&auth).await {
        Ok(()) => {
            send_auth_result(stream, SOCKS5_AUTH_SUCCESS).await?;
            Ok(())
        }
        Err(e) => {
            send_auth_result(stream, SOCKS5_AUTH_FAILURE).await?;
            Err(e)
        }
    }
}

async fn send_auth_result<S: AsyncWrite + Unpin>(stream: &mut S, status: u8) -> Result<()> {
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}
