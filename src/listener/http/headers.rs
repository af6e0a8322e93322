//! Header handling shared by the CONNECT and plain proxy paths

use crate::auth::Authentication;
use crate::transport::{Address, Destination, Network};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};

/// Realm advertised in `Proxy-Authenticate` challenges
pub const REALM: &str = "switchyard";

/// Headers that describe one hop and must not be forwarded
const HOP_BY_HOP: [&str; 8] = [
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "keep-alive",
];

/// Remove hop-by-hop headers, including every header named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    headers.remove(header::CONNECTION);
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Credentials carried by the proxy headers, if any.
///
/// `Proxy-Authorization` is the standard carrier; some clients put the same
/// value in `Proxy-Authenticate`, which is accepted as a fallback.
pub fn proxy_credentials(headers: &HeaderMap, source: Address) -> Option<Authentication> {
    let value = headers
        .get(header::PROXY_AUTHORIZATION)
        .or_else(|| headers.get(header::PROXY_AUTHENTICATE))?;
    Authentication::from_header(source, value.to_str().ok()?)
}

/// `Proxy-Authenticate` challenge
pub const CHALLENGE: &str = "Basic realm=\"switchyard\"";

/// [`CHALLENGE`] as a header value
pub fn challenge() -> HeaderValue {
    HeaderValue::from_static(CHALLENGE)
}

/// Destination named by an absolute-form request URI
pub fn absolute_destination(uri: &Uri) -> Option<Destination> {
    let scheme = uri.scheme_str()?;
    let host = uri.host()?;
    let port = uri
        .port_u16()
        .unwrap_or(if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 });
    Some(Destination::tcp(Address::parse(host), port))
}

/// Destination named by a CONNECT authority (`host:port`)
pub fn authority_destination(target: &str) -> Option<Destination> {
    Destination::parse(Network::Tcp, target)
}

/// Rewrite an absolute-form URI to origin-form (path and query only)
pub fn origin_form(uri: &Uri) -> Uri {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(path)
}
