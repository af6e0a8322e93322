//! Configuration module for Switchyard
//!
//! This module provides configuration types and TOML parsing. The pipeline
//! itself only sees the plain structs; loading happens once at startup.

mod resolver;
mod server;
mod transport;

pub use resolver::{ResolverConfig, RuleAction, RuleConfig, RuleTarget};
pub use server::{DispatchConfig, ListenNetwork, Protocol, ServerConfig};
pub use transport::TcpConfig;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Name resolution
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Username to password table for servers with `auth = true`
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// CIDR rules, in evaluation order
    #[serde(default)]
    pub rules: Vec<RuleConfig>,

    /// Listening servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Validate cross-server constraints and each server
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("No servers configured");
        }

        let mut endpoints = HashSet::new();
        let mut names = HashSet::new();
        for server in &self.servers {
            server.validate().map_err(anyhow::Error::msg)?;

            if !names.insert(server.name.as_str()) {
                bail!("Duplicate server name '{}'", server.name);
            }
            // Port 0 asks the OS for a free port, so it never collides.
            if server.port != 0 && !endpoints.insert((server.network, server.port)) {
                bail!(
                    "Server '{}': port {}/{:?} is already in use by another server",
                    server.name,
                    server.port,
                    server.network
                );
            }
            if server.auth && self.users.is_empty() {
                bail!(
                    "Server '{}': authentication required but no users configured",
                    server.name
                );
            }
        }

        if self.resolver.capacity == 0 {
            bail!("Resolver capacity must be positive");
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config.validate()?;
    Ok(config)
}
