use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use soupd_sfu::SfuConfig;
use std::path::Path;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub signaling: SignalingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket URL of the signaling server
    pub url: String,
    /// Delay before reconnecting after the connection drops or is refused
    pub reconnect_interval_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8443/".to_string(),
            reconnect_interval_ms: 3000,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SOUPD_SFU__NUM_WORKERS=4, SOUPD_SFU__LOG_TAGS=ice,dtls, ...
        builder = builder.add_source(
            Environment::with_prefix("SOUPD")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sfu.log_tags")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Check the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let url = self.signaling.url.trim();
        if url.is_empty() {
            errors.push("signaling.url must be set".to_string());
        } else if !url.starts_with("ws://") {
            // The client is built without TLS; terminate wss in front of it.
            errors.push(format!("signaling.url must be a ws:// URL, got {url}"));
        }
        if self.signaling.reconnect_interval_ms == 0 {
            errors.push("signaling.reconnect_interval_ms must be greater than 0".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {}",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors.into_iter().map(|e| format!("sfu: {e}")));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load and validate configuration.
///
/// Config file search order:
/// 1. the first command-line argument
/// 2. `SOUPD_CONFIG_PATH`
/// 3. ./config.yaml
/// 4. environment variables only
pub fn load_config(arg: Option<&str>) -> anyhow::Result<Config> {
    let config_path = arg
        .map(ToString::to_string)
        .or_else(|| std::env::var("SOUPD_CONFIG_PATH").ok())
        .filter(|p| Path::new(p).exists())
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    // Logging is not up yet.
    match &config_path {
        Some(path) => eprintln!("Loading config from {path}"),
        None => eprintln!("No config file found, using environment variables"),
    }
    let config = Config::load(config_path.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}
