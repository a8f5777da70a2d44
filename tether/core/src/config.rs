//! TOML Configuration File Support
//!
//! Centralized configuration loading for supervisors.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! service_name = "calc"
//!
//! [transport]
//! kind = "process"
//! program = "/usr/local/bin/tether-worker"
//! args = []
//!
//! [restart]
//! policy = "backoff"
//! initial_delay_ms = 100
//! max_delay_ms = 30000
//! max_restarts = 10
//!
//! [stream]
//! buffer_capacity = 64
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::StreamConfig;
use crate::transport::{RestartPolicy, TransportConfig, TransportType};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration Structure
// =============================================================================

/// Default logical service name
pub const DEFAULT_SERVICE_NAME: &str = "worker";

/// Complete supervisor configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Logical name of the supervised service
    pub service_name: String,

    /// Isolation primitive
    pub transport: TransportType,

    /// Restart policy
    pub restart: RestartPolicy,

    /// Stream multiplexer settings
    pub stream: StreamConfig,

    /// Where the configuration came from
    #[serde(skip)]
    pub source: ConfigSource,

    /// Path of the file that was loaded, if any
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            transport: TransportType::default(),
            restart: RestartPolicy::default(),
            stream: StreamConfig::default(),
            source: ConfigSource::Default,
            config_file_path: None,
        }
    }
}

impl TetherConfig {
    /// Transport part of the configuration
    #[must_use]
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            transport: self.transport.clone(),
            restart: self.restart.clone(),
        }
    }

    /// Check the values for consistency
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name must not be empty".into(),
            ));
        }

        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "stream.buffer_capacity must be at least 1".into(),
            ));
        }

        if let RestartPolicy::Backoff {
            initial_delay_ms,
            max_delay_ms,
            ..
        } = self.restart
        {
            if initial_delay_ms > max_delay_ms {
                return Err(ConfigError::ValidationError(format!(
                    "restart.initial_delay_ms ({initial_delay_ms}) exceeds restart.max_delay_ms ({max_delay_ms})"
                )));
            }
        }

        if let TransportType::Process { program, .. } = &self.transport {
            if program.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "transport.program must not be empty".into(),
                ));
            }
        }

        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed, or
/// validated. A path that does not exist is not an error.
pub fn load_config_from_path(path: Option<&Path>) -> Result<TetherConfig, ConfigError> {
    let mut config = TetherConfig::default();

    if let Some(config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.to_path_buf(),
                    source: e,
                })?;

            config = toml::from_str(&toml_content)?;
            config.config_file_path = Some(config_path.to_path_buf());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply environment variable overrides
///
/// Only variables that are set take effect:
/// - `TETHER_TRANSPORT`: "thread" or "process"
/// - `TETHER_WORKER_PROGRAM`: executable for the process transport
/// - `TETHER_RESTART`: "immediate", "backoff" or "disabled"
/// - `TETHER_RESTART_INITIAL_MS` / `TETHER_RESTART_MAX_MS` /
///   `TETHER_RESTART_MAX_ATTEMPTS`: backoff parameters
/// - `TETHER_STREAM_BUFFER`: stream buffer capacity
fn apply_env_config(config: &mut TetherConfig) {
    let mut touched = false;

    if let Ok(program) = std::env::var("TETHER_WORKER_PROGRAM") {
        let args = match &config.transport {
            TransportType::Process { args, .. } => args.clone(),
            TransportType::Thread => Vec::new(),
        };
        config.transport = TransportType::Process {
            program: PathBuf::from(program),
            args,
        };
        touched = true;
    }

    if let Ok(kind) = std::env::var("TETHER_TRANSPORT") {
        match kind.to_lowercase().as_str() {
            "thread" => {
                config.transport = TransportType::Thread;
                touched = true;
            }
            "process" if config.transport == TransportType::Thread => {
                tracing::warn!(
                    "TETHER_TRANSPORT=process without a worker program, keeping thread transport"
                );
            }
            "process" => touched = true,
            other => tracing::warn!(value = %other, "Unknown TETHER_TRANSPORT, ignoring"),
        }
    }

    if std::env::var("TETHER_RESTART").is_ok() {
        config.restart = TransportConfig::from_env().restart;
        touched = true;
    }

    if let Some(capacity) = std::env::var("TETHER_STREAM_BUFFER")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        config.stream.buffer_capacity = capacity;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config_from_path`] to apply command-line overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Service name override
    pub service_name: Option<String>,

    /// Worker program override (selects the process transport)
    pub worker_program: Option<PathBuf>,

    /// Worker arguments override
    pub worker_args: Option<Vec<String>>,

    /// Restart policy override
    pub restart: Option<RestartPolicy>,

    /// Stream buffer capacity override
    pub buffer_capacity: Option<usize>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set service name override
    #[must_use]
    pub fn with_service_name(mut self, name: String) -> Self {
        self.service_name = Some(name);
        self
    }

    /// Set worker program override
    #[must_use]
    pub fn with_worker_program(mut self, program: PathBuf) -> Self {
        self.worker_program = Some(program);
        self
    }

    /// Set worker arguments override
    #[must_use]
    pub fn with_worker_args(mut self, args: Vec<String>) -> Self {
        self.worker_args = Some(args);
        self
    }

    /// Set restart policy override
    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = Some(restart);
        self
    }

    /// Set stream buffer capacity override
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut TetherConfig) {
        if self.service_name.is_some()
            || self.worker_program.is_some()
            || self.worker_args.is_some()
            || self.restart.is_some()
            || self.buffer_capacity.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(name) = &self.service_name {
            config.service_name.clone_from(name);
        }

        if let Some(program) = &self.worker_program {
            let args = match &config.transport {
                TransportType::Process { args, .. } => args.clone(),
                TransportType::Thread => Vec::new(),
            };
            config.transport = TransportType::Process {
                program: program.clone(),
                args,
            };
        }

        if let (Some(new_args), TransportType::Process { args, .. }) =
            (&self.worker_args, &mut config.transport)
        {
            args.clone_from(new_args);
        }

        if let Some(restart) = &self.restart {
            config.restart = restart.clone();
        }

        if let Some(capacity) = self.buffer_capacity {
            config.stream.buffer_capacity = capacity;
        }
    }
}
