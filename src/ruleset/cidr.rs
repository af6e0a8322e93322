use super::{Outcome, Permit, Rule};
use crate::config::{RuleAction, RuleConfig, RuleTarget};
use ipnet::IpNet;
use std::net::IpAddr;

/// Allow or deny when the source or destination falls inside one of `nets`
#[derive(Debug, Clone)]
pub struct IpNetRule {
    nets: Vec<IpNet>,
    action: RuleAction,
    target: RuleTarget,
}

impl IpNetRule {
    /// Create a rule
    pub fn new(nets: Vec<IpNet>, action: RuleAction, target: RuleTarget) -> Self {
        IpNetRule {
            nets,
            action,
            target,
        }
    }

    /// Create a rule from its configuration
    pub fn from_config(config: &RuleConfig) -> Self {
        IpNetRule::new(config.cidrs.clone(), config.action, config.target)
    }

    fn matching(&self, ip: IpAddr) -> Option<&IpNet> {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.nets.iter().find(|net| net.contains(&ip))
    }
}

impl Rule for IpNetRule {
    fn name(&self) -> &'static str {
        "ipnet"
    }

    fn allow(&self, permit: &Permit) -> Outcome {
        let address = match self.target {
            RuleTarget::Source => &permit.source,
            RuleTarget::Destination => &permit.destination.address,
        };
        // Unresolved names cannot be matched against networks.
        let Some(ip) = address.ip() else {
            return Outcome::NoMatch;
        };

        match (self.matching(ip), self.action) {
            (None, _) => Outcome::NoMatch,
            (Some(_), RuleAction::Allow) => Outcome::Allow,
            (Some(net), RuleAction::Deny) => {
                Outcome::Deny(format!("{:?} {} in {}", self.target, ip, net).to_lowercase())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Address, Destination};

    fn permit(source: &str, destination: &str) -> Permit {
        Permit {
            source: Address::parse(source),
            destination: Destination::tcp(Address::parse(destination), 443),
        }
    }

    fn nets(cidrs: &[&str]) -> Vec<IpNet> {
        cidrs.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn test_deny_destination() {
        let rule = IpNetRule::new(
            nets(&["10.0.0.0/8", "fd00::/8"]),
            RuleAction::Deny,
            RuleTarget::Destination,
        );
        let outcome = rule.allow(&permit("192.168.0.2", "10.20.30.40"));
        assert_eq!(
            outcome,
            Outcome::Deny("destination 10.20.30.40 in 10.0.0.0/8".to_string())
        );
        assert!(matches!(
            rule.allow(&permit("192.168.0.2", "fd12::1")),
            Outcome::Deny(_)
        ));
        assert_eq!(rule.allow(&permit("10.0.0.1", "8.8.8.8")), Outcome::NoMatch);
    }

    #[test]
    fn test_allow_source() {
        let rule = IpNetRule::new(
            nets(&["192.168.0.0/16"]),
            RuleAction::Allow,
            RuleTarget::Source,
        );
        assert_eq!(rule.allow(&permit("192.168.4.4", "8.8.8.8")), Outcome::Allow);
        assert_eq!(rule.allow(&permit("172.16.0.1", "8.8.8.8")), Outcome::NoMatch);
    }

    #[test]
    fn test_mapped_source_matches_v4_network() {
        let rule = IpNetRule::new(
            nets(&["192.168.0.0/16"]),
            RuleAction::Allow,
            RuleTarget::Source,
        );
        assert_eq!(
            rule.allow(&permit("::ffff:192.168.4.4", "8.8.8.8")),
            Outcome::Allow
        );
    }

    #[test]
    fn test_domain_is_no_match() {
        let rule = IpNetRule::new(
            nets(&["0.0.0.0/0"]),
            RuleAction::Deny,
            RuleTarget::Destination,
        );
        assert_eq!(
            rule.allow(&permit("192.168.0.2", "example.com")),
            Outcome::NoMatch
        );
    }
}
