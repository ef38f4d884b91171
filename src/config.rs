use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from plumber.toml.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PlumberConfig {
    pub watch: WatchSection,
    pub systemd: SystemdConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchSection {
    pub service: String,
    pub memory_limit_kb: u64,
    pub poll_interval_ms: u64,
    pub overlap: OverlapPolicy,
    pub restart_after_stop_failure: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SystemdConfig {
    pub systemctl: PathBuf,
    /// Talk to the per-user service manager instead of the system one.
    pub user: bool,
    /// How long to poll for the stopped state after `systemctl stop` returns.
    pub stop_wait_secs: u64,
    pub proc_root: PathBuf,
}

/// What to do when a tick fires while the previous cycle is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Skip the tick.
    #[default]
    Skip,
    /// Run the new cycle alongside the old one.
    Allow,
}

// --- Default implementations ---

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            service: "CorsairService".to_string(),
            memory_limit_kb: 500_000,
            poll_interval_ms: 10 * 60 * 1000,
            overlap: OverlapPolicy::Skip,
            restart_after_stop_failure: false,
        }
    }
}

impl Default for SystemdConfig {
    fn default() -> Self {
        Self {
            systemctl: PathBuf::from("systemctl"),
            user: false,
            stop_wait_secs: 30,
            proc_root: PathBuf::from("/proc"),
        }
    }
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { field, reason } => write!(f, "invalid {field}: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl PlumberConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Validate the `[watch]` section and freeze it into a `WatchConfig`.
    pub fn watch_config(&self) -> Result<WatchConfig, ConfigError> {
        WatchConfig::new(
            &self.watch.service,
            Duration::from_millis(self.watch.poll_interval_ms),
            self.watch.memory_limit_kb,
        )
        .map(|c| {
            c.with_overlap(self.watch.overlap)
                .with_restart_after_stop_failure(self.watch.restart_after_stop_failure)
        })
    }
}

/// Immutable settings of one watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    service: String,
    interval: Duration,
    memory_limit_kb: u64,
    overlap: OverlapPolicy,
    restart_after_stop_failure: bool,
}

impl WatchConfig {
    pub fn new(
        service: &str,
        interval: Duration,
        memory_limit_kb: u64,
    ) -> Result<Self, ConfigError> {
        if service.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "service",
                reason: "service name must not be empty".to_string(),
            });
        }
        if interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "polling interval must be greater than zero".to_string(),
            });
        }
        Ok(Self {
            service: service.to_string(),
            interval,
            memory_limit_kb,
            overlap: OverlapPolicy::default(),
            restart_after_stop_failure: false,
        })
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_restart_after_stop_failure(mut self, enabled: bool) -> Self {
        self.restart_after_stop_failure = enabled;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_kb
    }

    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    pub fn restart_after_stop_failure(&self) -> bool {
        self.restart_after_stop_failure
    }
}
