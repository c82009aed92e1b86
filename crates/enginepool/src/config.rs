//! Configuration loaded from the environment.
//!
//! | Env Var                          | Default   |
//! |----------------------------------|-----------|
//! | `ENGINEPOOL_HOST`                | `0.0.0.0` |
//! | `ENGINEPOOL_PORT`                | `8080`    |
//! | `ENGINEPOOL_CAPACITY`            | `10`      |
//! | `ENGINEPOOL_START_PORT`          | `8888`    |
//! | `ENGINEPOOL_IDLE_THRESHOLD_SECS` | `1800`    |
//! | `ENGINEPOOL_SETTLE_DELAY_MS`     | `3000`    |
//! | `ENGINEPOOL_RESOLVE_TIMEOUT_MS`  | `10000`   |
//! | `ENGINEPOOL_RESOLVE_INTERVAL_MS` | `100`     |
//! | `ENGINEPOOL_WORKER_PATH`         | required  |
//! | `ENGINEPOOL_LAUNCHER`            | `sh`      |

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::transport::ServerConfig;

pub const DEFAULT_CAPACITY: usize = 10;
pub const DEFAULT_START_PORT: u16 = 8888;
pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESOLVE_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_LAUNCHER: &str = "sh";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be set")]
    Missing { var: &'static str },
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("capacity must be greater than zero")]
    ZeroCapacity,
    #[error("start port must be greater than zero")]
    ZeroStartPort,
    #[error("worker ports {start_port}..{start_port}+{capacity} run past 65535")]
    RangeOverflow { start_port: u16, capacity: usize },
    #[error("listen port {port} falls inside the worker port range")]
    ListenPortInRange { port: u16 },
}

/// Pool sizing, timing, and the worker executable.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub start_port: u16,
    /// Minimum age of a running worker before it may be evicted.
    pub idle_threshold: Duration,
    /// Pause between killing an evicted worker and reusing its port.
    pub settle_delay: Duration,
    /// Upper bound on waiting for a spawned worker's identity.
    pub resolve_timeout: Duration,
    pub resolve_interval: Duration,
    pub worker_path: PathBuf,
    /// Shell used as the launcher process.
    pub launcher: String,
}

impl PoolConfig {
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            start_port: DEFAULT_START_PORT,
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
            settle_delay: DEFAULT_SETTLE_DELAY,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            resolve_interval: DEFAULT_RESOLVE_INTERVAL,
            worker_path: worker_path.into(),
            launcher: DEFAULT_LAUNCHER.to_string(),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_start_port(mut self, start_port: u16) -> Self {
        self.start_port = start_port;
        self
    }

    pub fn with_idle_threshold(mut self, threshold: Duration) -> Self {
        self.idle_threshold = threshold;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// Last worker port, inclusive.
    pub fn end_port(&self) -> Result<u16, ConfigError> {
        validate_range(self.start_port, self.capacity)
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.end_port()
            .is_ok_and(|end| (self.start_port..=end).contains(&port))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.end_port().map(|_| ())
    }
}

/// Checks a worker port range and returns its last port.
pub(crate) fn validate_range(start_port: u16, capacity: usize) -> Result<u16, ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity);
    }
    if start_port == 0 {
        return Err(ConfigError::ZeroStartPort);
    }
    let end = usize::from(start_port) + capacity - 1;
    u16::try_from(end).map_err(|_| ConfigError::RangeOverflow {
        start_port,
        capacity,
    })
}

/// Everything the binary needs to start.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub pool: PoolConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();
        let server = ServerConfig {
            host: lookup("ENGINEPOOL_HOST").unwrap_or(defaults.host),
            port: parse_var(&lookup, "ENGINEPOOL_PORT", defaults.port)?,
        };

        let worker_path = lookup("ENGINEPOOL_WORKER_PATH")
            .filter(|path| !path.trim().is_empty())
            .ok_or(ConfigError::Missing {
                var: "ENGINEPOOL_WORKER_PATH",
            })?;

        let pool = PoolConfig {
            capacity: parse_var(&lookup, "ENGINEPOOL_CAPACITY", DEFAULT_CAPACITY)?,
            start_port: parse_var(&lookup, "ENGINEPOOL_START_PORT", DEFAULT_START_PORT)?,
            idle_threshold: Duration::from_secs(parse_var(
                &lookup,
                "ENGINEPOOL_IDLE_THRESHOLD_SECS",
                DEFAULT_IDLE_THRESHOLD.as_secs(),
            )?),
            settle_delay: parse_millis(
                &lookup,
                "ENGINEPOOL_SETTLE_DELAY_MS",
                DEFAULT_SETTLE_DELAY,
            )?,
            resolve_timeout: parse_millis(
                &lookup,
                "ENGINEPOOL_RESOLVE_TIMEOUT_MS",
                DEFAULT_RESOLVE_TIMEOUT,
            )?,
            resolve_interval: parse_millis(
                &lookup,
                "ENGINEPOOL_RESOLVE_INTERVAL_MS",
                DEFAULT_RESOLVE_INTERVAL,
            )?,
            worker_path: PathBuf::from(worker_path),
            launcher: lookup("ENGINEPOOL_LAUNCHER").unwrap_or_else(|| DEFAULT_LAUNCHER.to_string()),
        };

        pool.validate()?;
        if pool.contains_port(server.port) {
            return Err(ConfigError::ListenPortInRange { port: server.port });
        }

        Ok(Self { server, pool })
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(parsed),
            Err(e) => Err(ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            }),
        },
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_var(lookup, var, default_ms).map(Duration::from_millis)
}
