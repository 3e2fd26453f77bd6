use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use proxima_sfu::SfuConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds to wait for open signaling connections on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            shutdown_grace_secs: 10,
        }
    }
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

        // PROXIMA_SERVER__PORT, PROXIMA_SFU__MAX_ROOMS, ...
        builder = builder.add_source(
            Environment::with_prefix("PROXIMA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Collect every configuration problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.http_address().parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!("server address {} is invalid", self.http_address()));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {}",
                self.logging.format
            ));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Locate and load the configuration file, falling back to environment variables
///
/// Config file search order:
/// 1. PROXIMA_CONFIG_PATH environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. Environment variables only
pub fn load_config() -> anyhow::Result<Config> {
    let config_path = std::env::var("PROXIMA_CONFIG_PATH")
        .ok()
        .filter(|p| Path::new(p).exists())
        .or_else(|| Path::new("config.yaml").exists().then(|| "config.yaml".to_string()));

    // Logging is not up yet, so report to stderr
    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load {path}: {e}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?
    };

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:3000");
        assert_eq!(config.sfu.session_ttl_secs, 600);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.sfu.media_codecs.clear();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 4443\nsfu:\n  max_rooms: 7\n  transport:\n    announced_ip: 203.0.113.5\n",
        )
        .unwrap();

        let config = Config::from_file(path.to_str().unwrap()).unwrap();

        assert_eq!(config.server.port, 4443);
        assert_eq!(config.sfu.max_rooms, 7);
        assert_eq!(
            config.sfu.transport.announced_ip.as_deref(),
            Some("203.0.113.5")
        );
        assert_eq!(config.logging.level, "info");
    }
}
