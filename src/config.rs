//! Trace sizing configuration
//!
//! Reserving storage up front keeps the tracer from allocating while a
//! request runs. The reserved sizes come from a `calltrace.toml` file,
//! from environment variables, or from code.
//!
//! # Example calltrace.toml
//!
//! ```toml
//! # Calls expected per request
//! call_capacity = 10
//! # Checkpoints expected per call
//! checkpoint_capacity = 4
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding [`Config::call_capacity`]
pub const ENV_CALL_CAPACITY: &str = "CALLTRACE_CALL_CAPACITY";

/// Environment variable overriding [`Config::checkpoint_capacity`]
pub const ENV_CHECKPOINT_CAPACITY: &str = "CALLTRACE_CHECKPOINT_CAPACITY";

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value:?} (expected a non-negative integer)")]
    InvalidEnv { var: &'static str, value: String },
}

/// Result type for configuration loading
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Initial storage reserved by each trace
///
/// # Example
/// ```
/// use calltrace::Config;
///
/// let config = Config::default();
/// assert_eq!(config.call_capacity, 0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Calls a trace can record before its call storage grows
    ///
    /// Default: 0 (every trace starts empty)
    pub call_capacity: usize,

    /// Checkpoints each call can record before its checkpoint storage grows
    ///
    /// Default: 0
    pub checkpoint_capacity: usize,
}

impl Config {
    /// Create a configuration with the given call capacity
    pub fn with_call_capacity(call_capacity: usize) -> Self {
        Self {
            call_capacity,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    ///
    /// ```no_run
    /// use calltrace::Config;
    ///
    /// # fn main() -> Result<(), calltrace::ConfigError> {
    /// let config = Config::from_file("calltrace.toml")?;
    /// println!("reserving {} calls", config.call_capacity);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from environment variables only
    ///
    /// Checks `CALLTRACE_CALL_CAPACITY` and `CALLTRACE_CHECKPOINT_CAPACITY`;
    /// unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Override fields with any environment variables that are set
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(value) = read_env(ENV_CALL_CAPACITY)? {
            self.call_capacity = value;
        }
        if let Some(value) = read_env(ENV_CHECKPOINT_CAPACITY)? {
            self.checkpoint_capacity = value;
        }
        Ok(self)
    }
}

fn read_env(var: &'static str) -> Result<Option<usize>> {
    let Ok(value) = std::env::var(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
