//! Configuration for the sockwatch daemon
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides

use crate::streamer::StreamerSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SockwatchConfig {
    pub daemon: DaemonSettings,
    pub probe: ProbeSettings,
    pub streamer: StreamerConfig,
    pub monitors: MonitorSettings,
    pub shutdown: ShutdownSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// One kprobe: program name inside the object and the kernel function it
/// attaches to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KprobeSpec {
    pub program: String,
    pub function: String,
}

impl KprobeSpec {
    pub fn new(program: &str, function: &str) -> Self {
        Self {
            program: program.to_string(),
            function: function.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    /// Compiled probe object
    pub object_path: PathBuf,

    /// Where debugfs is expected (mounted here if missing)
    pub debugfs_path: PathBuf,

    /// Also baseline and stream IPv6 sockets
    pub ipv6: bool,

    pub kprobes: Vec<KprobeSpec>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from("/etc/sockwatch/sockwatch.o"),
            debugfs_path: PathBuf::from("/sys/kernel/debug"),
            ipv6: true,
            kprobes: vec![
                KprobeSpec::new("tcp_v4_connect", "tcp_v4_connect"),
                KprobeSpec::new("tcp_v6_connect", "tcp_v6_connect"),
                KprobeSpec::new("udp_sendmsg", "udp_sendmsg"),
                KprobeSpec::new("udpv6_sendmsg", "udpv6_sendmsg"),
                KprobeSpec::new("inet_release", "inet_release"),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Decode workers
    pub workers: usize,

    /// Name of the perf event array in the probe object
    pub perf_map: String,

    /// Read buffers per CPU
    pub buffer_count: usize,

    /// Capacity of each read buffer in bytes
    pub buffer_capacity: usize,

    /// Perf ring size per CPU, in pages (power of two)
    pub page_count: usize,

    /// Records queued per worker before readers wait
    pub queue_len: usize,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            perf_map: "SOCKET_EVENTS".to_string(),
            buffer_count: 16,
            buffer_capacity: 1024,
            page_count: 8,
            queue_len: 1024,
        }
    }
}

impl StreamerConfig {
    pub fn settings(&self) -> StreamerSettings {
        StreamerSettings {
            workers: self.workers,
            queue_len: self.queue_len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub cache_sweep_interval_ms: u64,
    /// Cache entries untouched this long are checked against the kernel
    pub cache_entry_ttl_ms: u64,
    pub tombstone_ttl_ms: u64,
    pub map_check_interval_ms: u64,
    pub local_addr_interval_ms: u64,
    pub baseline_interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            cache_sweep_interval_ms: 60_000,
            cache_entry_ttl_ms: 60_000,
            tombstone_ttl_ms: 60_000,
            map_check_interval_ms: 30_000,
            local_addr_interval_ms: 1_000,
            baseline_interval_ms: 2_000,
        }
    }
}

impl MonitorSettings {
    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.cache_sweep_interval_ms)
    }

    pub fn cache_entry_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_entry_ttl_ms)
    }

    pub fn tombstone_ttl(&self) -> Duration {
        Duration::from_millis(self.tombstone_ttl_ms)
    }

    pub fn map_check_interval(&self) -> Duration {
        Duration::from_millis(self.map_check_interval_ms)
    }

    pub fn local_addr_interval(&self) -> Duration {
        Duration::from_millis(self.local_addr_interval_ms)
    }

    pub fn baseline_interval(&self) -> Duration {
        Duration::from_millis(self.baseline_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 5_000,
        }
    }
}

impl ShutdownSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. SOCKWATCH_CONFIG environment variable
    /// 3. ~/.config/sockwatch/config.toml
    /// 4. /etc/sockwatch/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<SockwatchConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                SockwatchConfig::default()
            }
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("SOCKWATCH_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("SOCKWATCH_CONFIG path does not exist: {}", env_path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let path = config_dir.join("sockwatch").join("config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        let path = PathBuf::from("/etc/sockwatch/config.toml");
        if path.exists() {
            return Some(path);
        }

        None
    }

    fn load_from_file(&self, path: &Path) -> ConfigResult<SockwatchConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: SockwatchConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut SockwatchConfig) {
        if let Ok(val) = std::env::var("SOCKWATCH_LOG_LEVEL") {
            config.daemon.log_level = val;
        }
        if let Ok(val) = std::env::var("SOCKWATCH_PROBE_OBJECT") {
            config.probe.object_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SOCKWATCH_WORKERS") {
            config.streamer.workers = val.parse().unwrap_or(config.streamer.workers);
        }
        if let Ok(val) = std::env::var("SOCKWATCH_IPV6") {
            config.probe.ipv6 = val.parse().unwrap_or(config.probe.ipv6);
        }
    }

    fn validate(&self, config: &SockwatchConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.daemon.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.daemon.log_level, valid_levels
            )));
        }

        if config.probe.kprobes.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one kprobe must be configured".to_string(),
            ));
        }

        let streamer = &config.streamer;
        if streamer.workers == 0 || streamer.buffer_count == 0 || streamer.queue_len == 0 {
            return Err(ConfigError::ValidationError(
                "Streamer workers, buffer_count and queue_len must be positive".to_string(),
            ));
        }
        if !streamer.page_count.is_power_of_two() {
            return Err(ConfigError::ValidationError(format!(
                "Streamer page_count must be a power of two, got {}",
                streamer.page_count
            )));
        }

        let m = &config.monitors;
        let intervals = [
            ("cache_sweep_interval_ms", m.cache_sweep_interval_ms),
            ("map_check_interval_ms", m.map_check_interval_ms),
            ("local_addr_interval_ms", m.local_addr_interval_ms),
            ("baseline_interval_ms", m.baseline_interval_ms),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, ms)| *ms == 0) {
            return Err(ConfigError::ValidationError(format!(
                "Monitor interval {} cannot be 0",
                name
            )));
        }

        Ok(())
    }

    /// Default config file path for the current user
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("sockwatch").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}
