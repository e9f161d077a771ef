//! Layered configuration: defaults, then the TOML file, then environment.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::serial::{FrameMode, LinkSettings, MonitorSettings};
use crate::ws::OverflowPolicy;

pub const APP_NAME: &str = "telehub";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub serial: SerialConfig,
    pub hub: HubConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            serial: SerialConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served under `/js`.
    pub static_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            static_dir: "js".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    /// Upper bound for one blocking read, in milliseconds.
    pub read_timeout_ms: u64,
    pub frame_mode: FrameMode,
    /// Frame size when `frame_mode = "fixed"`.
    pub frame_len: usize,
    pub line_terminator: char,
    /// Appended to every command written to the device.
    pub command_terminator: String,
    /// Number of values a telemetry (`P`) frame must carry.
    pub telemetry_fields: usize,
    /// Hardware commands waiting for the link.
    pub command_queue: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 100,
            frame_mode: FrameMode::Line,
            frame_len: 16,
            line_terminator: '\n',
            command_terminator: String::new(),
            telemetry_fields: 4,
            command_queue: 32,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SerialConfig {
    pub fn link_settings(&self) -> LinkSettings {
        LinkSettings {
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            initial_backoff: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_backoff: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        }
    }

    pub fn monitor_settings(&self) -> Result<MonitorSettings> {
        let line_terminator = u8::try_from(self.line_terminator)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                anyhow!(
                    "serial.line_terminator must be a single ASCII character, got {:?}",
                    self.line_terminator
                )
            })?;

        Ok(MonitorSettings {
            frame_mode: self.frame_mode,
            frame_len: self.frame_len,
            line_terminator,
            command_terminator: self.command_terminator.clone(),
            telemetry_fields: self.telemetry_fields,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Failed opens or faults, with no traffic in between, before the link is
    /// given up. Unset retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Frames buffered per client before the overflow policy applies.
    pub client_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

impl AppConfig {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.serial.device.is_empty(), "serial.device must be set");
        ensure!(self.serial.baud_rate > 0, "serial.baud_rate must be positive");
        ensure!(
            self.serial.read_timeout_ms > 0,
            "serial.read_timeout_ms must be positive"
        );
        ensure!(self.serial.frame_len > 0, "serial.frame_len must be positive");
        ensure!(
            self.serial.telemetry_fields > 0,
            "serial.telemetry_fields must be positive"
        );
        ensure!(
            self.serial.command_queue > 0,
            "serial.command_queue must be positive"
        );
        ensure!(
            self.serial.command_terminator.is_ascii(),
            "serial.command_terminator must be ASCII"
        );
        ensure!(
            self.serial.reconnect.initial_delay_ms <= self.serial.reconnect.max_delay_ms,
            "serial.reconnect.initial_delay_ms cannot exceed max_delay_ms"
        );
        ensure!(
            self.serial.reconnect.max_attempts != Some(0),
            "serial.reconnect.max_attempts must be at least 1"
        );
        ensure!(
            self.hub.client_queue_capacity > 0,
            "hub.client_queue_capacity must be positive"
        );
        self.serial.monitor_settings()?;
        Ok(())
    }
}

/// Prefix for environment overrides, e.g. `TELEHUB__SERIAL__DEVICE`.
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Load configuration from `path` (optional) layered with the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("profile", "default")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("reading config from {}", path.display()))?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing config from {}", path.display()))
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push('\n');
    buffer
}
