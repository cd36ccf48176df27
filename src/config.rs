//! Code for the configuration of the daemon.

use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::Address;

/// The configuration of the daemon.
#[derive(Default, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Where the daemon listens for clients.
    #[serde(default)]
    pub server: ServerConfig,

    /// Deadlines applied to blocking calls.
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Machines the daemon connects to, keyed by machine id.
    #[serde(default)]
    pub machines: BTreeMap<String, MachineConfig>,
}

impl Config {
    /// Parse a configuration from a toml file.
    pub fn from_file(file: &Path) -> Result<Self> {
        let config = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
        Self::from_str(&config)
    }

    /// Parse a configuration from a toml string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> Result<Self> {
        Ok(toml::from_str(config)?)
    }
}

/// The configuration of the listening side.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address, `pipe:` or `tcp:`.
    #[serde(default = "default_server_address")]
    pub address: Address,
}

fn default_server_address() -> Address {
    Address::Pipe {
        path: "/tmp/machined.socket".into(),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

/// Deadlines for the synchronous job runner, in seconds.
#[derive(Default, Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Give up on a job this long after it started.
    pub timeout_secs: Option<f64>,
    /// Give up on a job this long after its last heartbeat.
    pub heartbeat_timeout_secs: Option<f64>,
}

impl RunnerConfig {
    /// Overall deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.and_then(seconds)
    }

    /// Heartbeat deadline.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_secs.and_then(seconds)
    }
}

fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

/// The configuration for a single machine.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MachineConfig {
    /// How to reach the machine.
    pub address: Address,
    /// Free-form description shown to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
