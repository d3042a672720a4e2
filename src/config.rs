use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::PortalError;
use crate::lifecycle::PollPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "portal-dataset.json";
pub const DEFAULT_API_BASE: &str = "https://api.scpca.alexslemonade.org/v1";
pub const TOKEN_ENV: &str = "PORTAL_API_TOKEN";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub max_poll_attempts: Option<usize>,
    #[serde(default)]
    pub retention_days: Option<i64>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default)]
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub api_base_url: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: usize,
    pub retention: chrono::Duration,
    pub request_timeout: Duration,
    pub state_dir: Option<Utf8PathBuf>,
    pub api_token: Option<String>,
}

impl ResolvedConfig {
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_attempts: self.max_poll_attempts,
            retention: self.retention,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `portal-dataset.json` in the working directory when it
    /// exists; with neither, every setting takes its default.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PortalError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PortalError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PortalError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PortalError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(PortalError::ConfigParse(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let api_base_url = config
            .api_base_url
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        let poll_interval_secs = config.poll_interval_secs.unwrap_or(10);
        if poll_interval_secs == 0 {
            return Err(PortalError::ConfigParse(
                "poll_interval_secs must be positive".to_string(),
            ));
        }

        let api_token = std::env::var(TOKEN_ENV)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        Ok(ResolvedConfig {
            schema_version,
            api_base_url,
            poll_interval: Duration::from_secs(poll_interval_secs),
            max_poll_attempts: config.max_poll_attempts.unwrap_or(360).max(1),
            retention: chrono::Duration::days(config.retention_days.unwrap_or(7)),
            request_timeout: Duration::from_secs(config.request_timeout_secs.unwrap_or(30)),
            state_dir: config.state_dir.map(Utf8PathBuf::from),
            api_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_apply() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.api_base_url, DEFAULT_API_BASE);
        assert_eq!(resolved.poll_interval, Duration::from_secs(10));
        assert_eq!(resolved.retention, chrono::Duration::days(7));
        assert!(resolved.state_dir.is_none());
    }

    #[test]
    fn zero_interval_rejected() {
        let config = Config {
            poll_interval_secs: Some(0),
            ..Default::default()
        };
        assert_matches!(
            ConfigLoader::resolve_config(config),
            Err(PortalError::ConfigParse(_))
        );
    }

    #[test]
    fn trailing_slash_trimmed() {
        let config = Config {
            api_base_url: Some("http://localhost:8000/v1/".to_string()),
            ..Default::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.api_base_url, "http://localhost:8000/v1");
    }
}
