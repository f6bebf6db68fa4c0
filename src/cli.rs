//! CLI argument parsing for the calltrace demo binary

use crate::config::{Config, ConfigError};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "calltrace")]
#[command(version)]
#[command(about = "Run a traced request pipeline and print its call report", long_about = None)]
pub struct Cli {
    /// Load trace sizing from a TOML file
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Calls to reserve per trace (overrides config file and environment)
    #[arg(long = "capacity", value_name = "N")]
    pub call_capacity: Option<usize>,

    /// Checkpoints to reserve per call (overrides config file and environment)
    #[arg(long = "checkpoint-capacity", value_name = "N")]
    pub checkpoint_capacity: Option<usize>,

    /// Number of requests to simulate
    #[arg(short = 'n', long = "requests", value_name = "N", default_value = "1")]
    pub requests: usize,

    /// Simulated work per pipeline step, in milliseconds
    #[arg(long = "work-ms", value_name = "MS", default_value = "1")]
    pub work_ms: u64,

    /// Request body (TOML with `title` and `subtitle`)
    #[arg(long = "body", value_name = "TOML")]
    pub body: Option<String>,

    /// Enable debug logging to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Resolve the trace configuration: file, then environment, then flags
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        let mut config = config.apply_env()?;

        if let Some(call_capacity) = self.call_capacity {
            config.call_capacity = call_capacity;
        }
        if let Some(checkpoint_capacity) = self.checkpoint_capacity {
            config.checkpoint_capacity = checkpoint_capacity;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["calltrace"]);
        assert!(cli.config.is_none());
        assert!(cli.call_capacity.is_none());
        assert_eq!(cli.requests, 1);
        assert_eq!(cli.work_ms, 1);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "calltrace",
            "--capacity",
            "10",
            "--checkpoint-capacity",
            "2",
            "-n",
            "3",
            "--work-ms",
            "0",
            "--debug",
        ]);
        assert_eq!(cli.call_capacity, Some(10));
        assert_eq!(cli.checkpoint_capacity, Some(2));
        assert_eq!(cli.requests, 3);
        assert_eq!(cli.work_ms, 0);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_rejects_negative_capacity() {
        let result = Cli::try_parse_from(["calltrace", "--capacity", "-1"]);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn test_load_config_flags_win() {
        std::env::set_var(crate::config::ENV_CALL_CAPACITY, "4");

        let cli = Cli::parse_from(["calltrace", "--capacity", "7"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.call_capacity, 7);

        let cli = Cli::parse_from(["calltrace"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.call_capacity, 4);

        std::env::remove_var(crate::config::ENV_CALL_CAPACITY);
    }

    #[test]
    #[serial]
    fn test_load_config_missing_file() {
        let cli = Cli::parse_from(["calltrace", "--config", "/nonexistent/calltrace.toml"]);
        assert!(matches!(cli.load_config(), Err(ConfigError::Io { .. })));
    }
}
