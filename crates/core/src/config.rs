//! Layered application configuration.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::proto::SandboxLimits;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub processor: ProcessorConfig,
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Controller-level tuning: the liveness cadence and the default per-message
/// timeout handed to the sandbox side.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessorConfig {
    pub ping_interval_ms: u64,
    pub default_timeout_ms: u64,
}

impl ProcessorConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn limits(&self) -> SandboxLimits {
        SandboxLimits {
            default_timeout_ms: self.default_timeout_ms,
        }
    }
}

/// Sandbox plumbing knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxSettings {
    /// Bound on each boundary channel; backpressure, not a rate limit.
    pub channel_capacity: usize,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("PIPEFORGE_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__SERVER__PORT=3000 to app.server.port
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 3000,
            },
            processor: ProcessorConfig::default(),
            sandbox: SandboxSettings::default(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5000,
            default_timeout_ms: 30_000,
        }
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}
