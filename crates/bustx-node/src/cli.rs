//! CLI argument parsing for bustxd

use crate::config::{LogFormat, RuntimeEnv};
use clap::Parser;
use std::path::PathBuf;

/// bustx transaction server
#[derive(Parser, Debug, Clone)]
#[command(name = "bustxd")]
#[command(about = "bustx transaction server")]
#[command(version)]
pub struct Cli {
    /// Server id on the bus
    #[arg(long)]
    pub id: Option<u32>,

    /// JSON config file (CLI flags override its values)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Timer tick in milliseconds [default: 100]
    #[arg(long)]
    pub tick_ms: Option<u64>,

    /// Statistics interval in seconds [default: 60]
    #[arg(long)]
    pub stats_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Reject duplicate requests from the same requester
    #[arg(long)]
    pub use_locker: bool,

    /// Runtime environment
    #[arg(long, value_enum)]
    pub runtime_env: Option<RuntimeEnv>,

    /// Generate demo traffic
    #[arg(long)]
    pub demo: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["bustxd"]);
        assert!(cli.id.is_none());
        assert!(cli.config.is_none());
        assert!(cli.tick_ms.is_none());
        assert!(cli.stats_interval_secs.is_none());
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(!cli.use_locker);
        assert!(cli.runtime_env.is_none());
        assert!(!cli.demo);
    }

    #[test]
    fn test_cli_custom_values() {
        let cli = Cli::parse_from([
            "bustxd",
            "--id",
            "7",
            "--config",
            "/etc/bustx/node.json",
            "--tick-ms",
            "50",
            "--stats-interval-secs",
            "5",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "--use-locker",
            "--runtime-env",
            "dev",
            "--demo",
        ]);
        assert_eq!(cli.id, Some(7));
        assert_eq!(cli.config, Some(PathBuf::from("/etc/bustx/node.json")));
        assert_eq!(cli.tick_ms, Some(50));
        assert_eq!(cli.stats_interval_secs, Some(5));
        assert_eq!(cli.log_level, "debug");
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(cli.use_locker);
        assert_eq!(cli.runtime_env, Some(RuntimeEnv::Dev));
        assert!(cli.demo);
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["bustxd", "--log-format", "xml"]).is_err());
    }
}
