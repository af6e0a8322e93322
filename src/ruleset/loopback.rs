use super::{Outcome, Permit, Rule};
use crate::transport::{Address, Network};
use std::net::{IpAddr, SocketAddr};

/// Denies destinations that are this process's own listening endpoints
#[derive(Debug, Clone)]
pub struct LoopbackRule {
    endpoints: Vec<(Network, SocketAddr)>,
}

impl LoopbackRule {
    /// Guard the given listening endpoints
    pub fn new(endpoints: Vec<(Network, SocketAddr)>) -> Self {
        LoopbackRule { endpoints }
    }

    fn is_local(address: &Address, bind: IpAddr) -> bool {
        match address {
            Address::Domain(name) => {
                let name = name.trim_end_matches('.');
                name.eq_ignore_ascii_case("localhost")
                    || name.to_ascii_lowercase().ends_with(".localhost")
            }
            ip => match ip.ip().map(unmap) {
                Some(ip) => ip == unmap(bind) || ip.is_loopback() || ip.is_unspecified(),
                None => false,
            },
        }
    }
}

fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

impl Rule for LoopbackRule {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn allow(&self, permit: &Permit) -> Outcome {
        let dest = &permit.destination;
        let looped = self.endpoints.iter().any(|(network, addr)| {
            (dest.network == *network || dest.network == Network::Unset)
                && dest.port == addr.port()
                && Self::is_local(&dest.address, addr.ip())
        });

        if looped {
            Outcome::Deny(format!("{} is a local listener", dest))
        } else {
            Outcome::NoMatch
        }
    }
}
