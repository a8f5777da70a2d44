//! Transport Configuration
//!
//! Configuration types for selecting the isolation primitive and the
//! restart policy applied when a worker dies.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Isolation primitive used for the worker
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportType {
    /// Worker runs on a dedicated OS thread with its own runtime
    ///
    /// Binary payloads cross the boundary without re-encoding. The worker
    /// entry point must be supplied in code, it cannot be named in config.
    #[default]
    Thread,

    /// Worker runs as a separate OS process
    ///
    /// Messages travel as checksummed frames over the child's stdin/stdout.
    Process {
        /// Executable to spawn
        program: PathBuf,
        /// Extra arguments passed to the executable
        #[serde(default)]
        args: Vec<String>,
    },
}

/// What the supervisor does when its worker terminates abnormally
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Respawn right away, forever
    #[default]
    Immediate,

    /// Respawn after an exponentially growing delay
    Backoff {
        /// Delay before the first restart
        initial_delay_ms: u64,
        /// Upper bound for the delay
        max_delay_ms: u64,
        /// Give up after this many consecutive restarts (None = never)
        #[serde(default)]
        max_restarts: Option<u32>,
    },

    /// Never respawn; the transport closes with the worker
    Disabled,
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based)
    ///
    /// Returns `None` when the policy forbids another restart.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match self {
            Self::Immediate => Some(Duration::ZERO),
            Self::Disabled => None,
            Self::Backoff {
                initial_delay_ms,
                max_delay_ms,
                max_restarts,
            } => {
                if max_restarts.is_some_and(|max| attempt > max) {
                    return None;
                }
                let exponent = attempt.saturating_sub(1).min(32);
                let delay = initial_delay_ms
                    .saturating_mul(1u64 << exponent)
                    .min(*max_delay_ms);
                Some(Duration::from_millis(delay))
            }
        }
    }
}

/// Transport configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which isolation primitive to use
    pub transport: TransportType,

    /// What to do when the worker crashes
    pub restart: RestartPolicy,
}

impl TransportConfig {
    /// Configuration for a thread-isolated worker
    #[must_use]
    pub fn thread() -> Self {
        Self::default()
    }

    /// Configuration for a process-isolated worker
    pub fn process(program: impl Into<PathBuf>) -> Self {
        Self {
            transport: TransportType::Process {
                program: program.into(),
                args: Vec::new(),
            },
            ..Default::default()
        }
    }

    /// Replace the restart policy
    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `TETHER_TRANSPORT`: "thread" or "process"
    /// - `TETHER_WORKER_PROGRAM`: executable for the process transport
    /// - `TETHER_RESTART`: "immediate", "backoff" or "disabled"
    /// - `TETHER_RESTART_INITIAL_MS`: first backoff delay in ms
    /// - `TETHER_RESTART_MAX_MS`: backoff delay cap in ms
    /// - `TETHER_RESTART_MAX_ATTEMPTS`: consecutive restart cap
    pub fn from_env() -> Self {
        let transport = match std::env::var("TETHER_TRANSPORT")
            .as_deref()
            .map(str::to_lowercase)
        {
            Ok(ref s) if s == "process" => match std::env::var("TETHER_WORKER_PROGRAM") {
                Ok(program) => TransportType::Process {
                    program: PathBuf::from(program),
                    args: Vec::new(),
                },
                Err(_) => {
                    tracing::warn!(
                        "TETHER_TRANSPORT=process without TETHER_WORKER_PROGRAM, using thread"
                    );
                    TransportType::Thread
                }
            },
            _ => TransportType::default(),
        };

        let restart = match std::env::var("TETHER_RESTART")
            .as_deref()
            .map(str::to_lowercase)
        {
            Ok(ref s) if s == "disabled" || s == "none" => RestartPolicy::Disabled,
            Ok(ref s) if s == "backoff" => RestartPolicy::Backoff {
                initial_delay_ms: env_number("TETHER_RESTART_INITIAL_MS").unwrap_or(100),
                max_delay_ms: env_number("TETHER_RESTART_MAX_MS").unwrap_or(30_000),
                max_restarts: env_number("TETHER_RESTART_MAX_ATTEMPTS"),
            },
            _ => RestartPolicy::Immediate,
        };

        Self { transport, restart }
    }

    /// Check if this is a thread-isolated configuration
    #[must_use]
    pub fn is_thread(&self) -> bool {
        matches!(self.transport, TransportType::Thread)
    }

    /// Check if this is a process-isolated configuration
    #[must_use]
    pub fn is_process(&self) -> bool {
        matches!(self.transport, TransportType::Process { .. })
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
