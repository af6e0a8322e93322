//! Resolver and ruleset configuration

use crate::helper::{duration_from_secs, DEFAULT_RESOLVER_CAPACITY, DEFAULT_RESOLVER_TTL_SECS};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

fn default_ttl_secs() -> u64 {
    DEFAULT_RESOLVER_TTL_SECS
}

fn default_capacity() -> usize {
    DEFAULT_RESOLVER_CAPACITY
}

/// Name resolution settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Cache entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum cached names
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Static overrides, consulted before anything else
    #[serde(default)]
    pub hosts: HashMap<String, IpAddr>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
            hosts: HashMap::new(),
        }
    }
}

impl ResolverConfig {
    /// Cache TTL as a duration
    pub fn ttl(&self) -> Duration {
        duration_from_secs(self.ttl_secs)
    }
}

/// What a matching rule decides
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Allow and stop evaluating
    #[serde(rename = "allow")]
    Allow,
    /// Deny and stop evaluating
    #[serde(rename = "deny")]
    Deny,
}

/// Which side of a permit a rule inspects
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RuleTarget {
    /// Client address
    #[serde(rename = "source")]
    Source,
    /// Resolved destination address
    #[serde(rename = "destination")]
    Destination,
}

/// One CIDR rule, evaluated in file order after the loopback guard
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RuleConfig {
    /// Decision on match
    pub action: RuleAction,
    /// Inspected side
    pub target: RuleTarget,
    /// Networks to match
    pub cidrs: Vec<IpNet>,
}
