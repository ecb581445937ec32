//! Configuration types for bustxd

use crate::cli::Cli;
use crate::server::{NodeError, NodeResult};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnv {
    /// Production
    #[default]
    Formal,
    /// Development
    Dev,
    /// Test
    Test,
    /// Pre-production
    Informal,
}

impl fmt::Display for RuntimeEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Formal => "formal",
            Self::Dev => "dev",
            Self::Test => "test",
            Self::Informal => "informal",
        };
        f.write_str(name)
    }
}

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Server id on the bus
    #[serde(default)]
    pub id: u32,
    /// Timer tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Statistics interval in seconds
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Reject duplicate requests from the same requester
    #[serde(default)]
    pub use_locker: bool,
    /// Capacity of the inbound and outbound frame channels
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Runtime environment
    #[serde(default)]
    pub runtime_env: RuntimeEnv,
    /// Demo traffic
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Demo traffic configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Generate traffic
    #[serde(default)]
    pub enabled: bool,
    /// Requests generated per tick
    #[serde(default = "default_requests_per_tick")]
    pub requests_per_tick: u32,
    /// Requester ids are drawn from `0..requester_pool`
    #[serde(default = "default_requester_pool")]
    pub requester_pool: u32,
}

fn default_tick_ms() -> u64 {
    100
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_inbox_capacity() -> usize {
    4096
}

fn default_requests_per_tick() -> u32 {
    4
}

fn default_requester_pool() -> u32 {
    64
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            tick_ms: default_tick_ms(),
            stats_interval_secs: default_stats_interval_secs(),
            use_locker: false,
            inbox_capacity: default_inbox_capacity(),
            runtime_env: RuntimeEnv::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_tick: default_requests_per_tick(),
            requester_pool: default_requester_pool(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> NodeResult<Self> {
        tracing::info!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override file values with the flags given on the command line
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(id) = cli.id {
            self.id = id;
        }
        if let Some(tick_ms) = cli.tick_ms {
            self.tick_ms = tick_ms;
        }
        if let Some(secs) = cli.stats_interval_secs {
            self.stats_interval_secs = secs;
        }
        if let Some(env) = cli.runtime_env {
            self.runtime_env = env;
        }
        self.use_locker |= cli.use_locker;
        self.demo.enabled |= cli.demo;
    }

    /// Reject values the run loop cannot work with
    pub fn validate(&self) -> NodeResult<()> {
        if self.tick_ms == 0 {
            return Err(NodeError::InvalidConfig("tick_ms must be positive".to_string()));
        }
        if self.stats_interval_secs == 0 {
            return Err(NodeError::InvalidConfig(
                "stats_interval_secs must be positive".to_string(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(NodeError::InvalidConfig(
                "inbox_capacity must be positive".to_string(),
            ));
        }
        if self.demo.enabled && self.demo.requester_pool == 0 {
            return Err(NodeError::InvalidConfig(
                "demo.requester_pool must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Timer tick
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Statistics interval
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
