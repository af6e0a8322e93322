//! Admission rules
//!
//! A [`Ruleset`] is an ordered chain of [`Rule`]s evaluated over a
//! [`Permit`]. The loopback guard always runs first; configured CIDR rules
//! follow in file order. The first definite `Allow` or `Deny` wins; if every
//! rule abstains the chain reports `NoMatch`, which callers treat as allowed.

mod cidr;
mod loopback;

pub use cidr::IpNetRule;
pub use loopback::LoopbackRule;

use crate::config::RuleConfig;
use crate::transport::{Address, Destination};
use std::fmt::{self, Debug};
use tracing::debug;

/// Source and destination of a request under evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permit {
    /// Client address
    pub source: Address,
    /// Requested destination, resolved when the chain runs in the pipeline
    pub destination: Destination,
}

/// Result of evaluating a rule or a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Explicitly allowed
    Allow,
    /// Explicitly denied, with a reason for the logs
    Deny(String),
    /// The rule does not apply
    NoMatch,
}

impl Outcome {
    /// Whether the request may proceed
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Outcome::Deny(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Allow => write!(f, "allow"),
            Outcome::Deny(reason) => write!(f, "deny ({})", reason),
            Outcome::NoMatch => write!(f, "no match"),
        }
    }
}

/// One admission check. Rules hold no mutable state.
pub trait Rule: Send + Sync + Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Evaluate the permit
    fn allow(&self, permit: &Permit) -> Outcome;
}

/// Ordered rule chain, loopback guard first
#[derive(Debug)]
pub struct Ruleset {
    rules: Vec<Box<dyn Rule>>,
}

impl Ruleset {
    /// Build a chain with `loopback` in front of `rules`
    pub fn new(loopback: LoopbackRule, rules: Vec<Box<dyn Rule>>) -> Self {
        let mut chain: Vec<Box<dyn Rule>> = Vec::with_capacity(rules.len() + 1);
        chain.push(Box::new(loopback));
        chain.extend(rules);
        Ruleset { rules: chain }
    }

    /// Build a chain from configured CIDR rules
    pub fn from_config(loopback: LoopbackRule, rules: &[RuleConfig]) -> Self {
        let rules = rules
            .iter()
            .map(|rule| Box::new(IpNetRule::from_config(rule)) as Box<dyn Rule>)
            .collect();
        Ruleset::new(loopback, rules)
    }

    /// Evaluate the chain, short-circuiting on the first definite outcome
    pub fn allow(&self, permit: &Permit) -> Outcome {
        for rule in &self.rules {
            match rule.allow(permit) {
                Outcome::NoMatch => continue,
                outcome => {
                    debug!(
                        "Rule {} decided {} for {} -> {}",
                        rule.name(),
                        outcome,
                        permit.source,
                        permit.destination
                    );
                    return outcome;
                }
            }
        }
        Outcome::NoMatch
    }

    /// Number of rules including the loopback guard
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
