use serde::{Deserialize, Deserializer};
use std::{env, fs, path::Path};
use thiserror::Error;

use crate::persistence::PersistenceConfig;

/// Default location of the main configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "conf/config_main.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub enable_trace: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_trace: false,
        }
    }
}

/// One `mqtt.auth.internal` entry.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthSection {
    pub internal: Vec<CredentialEntry>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TcpSection {
    /// Interface to bind; empty means every interface.
    pub host: String,
    /// Kept as text: an empty value selects the default port.
    #[serde(deserialize_with = "port_as_string")]
    pub port: String,
    pub ssl_enable: bool,
    pub ssl_cert_file: String,
    pub ssl_cert_key_file: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MqttConfig {
    pub auth: AuthSection,
    pub tcp: TcpSection,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enable: bool,
    pub bind_addr: String,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enable: true,
            bind_addr: "127.0.0.1:6061".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub mqtt: MqttConfig,
    pub persistence: PersistenceConfig,
    pub diagnostics: DiagnosticsConfig,
}

// `port = 1883` and `port = "1883"` are both accepted.
fn port_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Text(String),
        Number(u64),
    }

    Ok(match RawPort::deserialize(deserializer)? {
        RawPort::Text(s) => s,
        RawPort::Number(n) => n.to_string(),
    })
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)?;
        let ext = path_ref
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("toml")
            .to_ascii_lowercase();

        if ext == "yaml" || ext == "yml" {
            Ok(serde_yaml::from_str(&raw)?)
        } else {
            Self::from_toml_str(&raw)
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// `RELAYMQ_CONFIG` replaces the path given on the command line. File
    /// values are then overridden by `RELAYMQ_LOG_LEVEL`, `RELAYMQ_TCP_PORT`
    /// and `RELAYMQ_PERSISTENCE_FILE` when set.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let effective_path = env::var("RELAYMQ_CONFIG")
            .ok()
            .or_else(|| path.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::load_file(&effective_path)?;

        if let Ok(v) = env::var("RELAYMQ_LOG_LEVEL") {
            config.log.level = v;
        }

        if let Ok(v) = env::var("RELAYMQ_TCP_PORT") {
            if !v.is_empty() {
                v.parse::<u16>()
                    .map_err(|e| ConfigError::Parse(format!("RELAYMQ_TCP_PORT: {e}")))?;
            }
            config.mqtt.tcp.port = v;
        }

        if let Ok(v) = env::var("RELAYMQ_PERSISTENCE_FILE") {
            config.persistence.file = v.into();
        }

        Ok(config)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    Config::load_file(path)
}
