use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the trackd daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Directory experiments are stored under.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// TCP ports of the node.
    #[serde(default)]
    pub ports: PortsConfig,

    /// Disk headroom monitoring configuration.
    #[serde(default)]
    pub disk: DiskConfig,

    /// Tracker child process configuration.
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Video encoder configuration.
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Node this one forwards frames to; empty on a master node.
    #[serde(default)]
    pub master: String,

    /// Slave nodes participating in this node's experiments.
    #[serde(default)]
    pub slaves: Vec<String>,
}

/// TCP ports of the node.
#[derive(Debug, Deserialize)]
pub struct PortsConfig {
    /// Supervisor command port. Default: 4000.
    #[serde(default = "default_command_port")]
    pub command: u16,

    /// Inbound frame stream port. Default: 4001.
    #[serde(default = "default_frames_port")]
    pub frames: u16,

    /// Merged-frame broadcast port. Default: 4002.
    #[serde(default = "default_broadcast_port")]
    pub broadcast: u16,

    /// Monitoring service port on the stream host. Default: 3001.
    #[serde(default = "default_monitor_port")]
    pub monitor: u16,
}

/// Disk headroom monitoring configuration.
#[derive(Debug, Deserialize)]
pub struct DiskConfig {
    /// Free bytes under which the experiment aborts. Default: 50 MiB.
    #[serde(default = "default_disk_limit")]
    pub limit_bytes: i64,

    /// Sampling period. Default: 5s.
    #[serde(default = "default_disk_poll", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Tracker child process configuration.
#[derive(Debug, Deserialize)]
pub struct TrackerConfig {
    /// Tracker binary. Default: "artemis".
    #[serde(default = "default_tracker_command")]
    pub command: String,

    /// Minimum accepted tracker version. Default: "v0.4.0".
    #[serde(default = "default_tracker_min_version")]
    pub min_version: String,
}

/// Video encoder configuration.
#[derive(Debug, Deserialize)]
pub struct EncoderConfig {
    /// Encoder binary. Default: "ffmpeg".
    #[serde(default = "default_encoder_command")]
    pub command: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/trackd/experiments")
}

fn default_command_port() -> u16 {
    4000
}

fn default_frames_port() -> u16 {
    4001
}

fn default_broadcast_port() -> u16 {
    4002
}

fn default_monitor_port() -> u16 {
    3001
}

fn default_disk_limit() -> i64 {
    50 * 1024 * 1024 // 50 MiB
}

fn default_disk_poll() -> Duration {
    Duration::from_secs(5)
}

fn default_tracker_command() -> String {
    "artemis".to_string()
}

fn default_tracker_min_version() -> String {
    "v0.4.0".to_string()
}

fn default_encoder_command() -> String {
    "ffmpeg".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: default_data_dir(),
            ports: PortsConfig::default(),
            disk: DiskConfig::default(),
            tracker: TrackerConfig::default(),
            encoder: EncoderConfig::default(),
            health: HealthConfig::default(),
            master: String::new(),
            slaves: Vec::new(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            command: default_command_port(),
            frames: default_frames_port(),
            broadcast: default_broadcast_port(),
            monitor: default_monitor_port(),
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            limit_bytes: default_disk_limit(),
            poll_interval: default_disk_poll(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: default_tracker_command(),
            min_version: default_tracker_min_version(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            command: default_encoder_command(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            bail!("data_dir is required");
        }

        if self.disk.limit_bytes <= 0 {
            bail!("disk.limit_bytes must be positive");
        }

        if self.tracker.command.is_empty() {
            bail!("tracker.command is required");
        }

        if self.encoder.command.is_empty() {
            bail!("encoder.command is required");
        }

        if !self.master.is_empty() && !self.slaves.is_empty() {
            bail!("a slave node cannot have slaves of its own");
        }

        let ports = [
            self.ports.command,
            self.ports.frames,
            self.ports.broadcast,
        ];
        for (i, a) in ports.iter().enumerate() {
            if *a == 0 {
                bail!("ports must be non-zero");
            }
            if ports[i + 1..].contains(a) {
                bail!("port {a} is used twice");
            }
        }

        Ok(())
    }
}
