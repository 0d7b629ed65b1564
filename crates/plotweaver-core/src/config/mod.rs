//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// PlotWeaver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub request: RequestConfig,
    pub cache: CacheConfig,
    pub channel: ChannelConfig,
}

/// Backend location and identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Path (relative to `base_url`) of the push-update stream
    pub stream_path: String,
    /// User id recorded as `lockedBy` on locks created from this client
    pub user_id: String,
    /// Only ever read so that a token left in the file is rejected; never written
    #[serde(default, skip_serializing, alias = "token")]
    pub api_token: Option<String>,
}

/// Timeout and retry settings for every backend call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

/// Reconnection settings for push-update subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            stream_path: "/stream".to_string(),
            user_id: "current-user".to_string(),
            api_token: None,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_reconnect_attempts: 5,
        }
    }
}

impl RequestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl ApiConfig {
    /// Base URL with `PLOTWEAVER_API_URL` taking precedence over the file
    pub fn resolved_base_url(&self) -> String {
        env::var("PLOTWEAVER_API_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| self.base_url.clone())
            .trim_end_matches('/')
            .to_string()
    }

    pub fn resolved_api_token(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;
        Ok(env::var("PLOTWEAVER_API_TOKEN").ok())
    }

    pub fn redacted_api_token(&self) -> anyhow::Result<Option<String>> {
        Ok(self.resolved_api_token()?.map(|token| redact_token(&token)))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_token.is_some() {
            return Err(anyhow!(
                "API tokens must be provided via the PLOTWEAVER_API_TOKEN environment variable, not stored in configuration"
            ));
        }
        Ok(())
    }
}

/// Keep only the last four characters of a secret
fn redact_token(token: &str) -> String {
    let count = token.chars().count();
    if count <= 4 {
        return "***".to_string();
    }
    let tail: String = token.chars().skip(count - 4).collect();
    format!("***{}", tail)
}

const KEYS: &[&str] = &[
    "api.base_url",
    "api.stream_path",
    "api.user_id",
    "api.token",
    "request.timeout_ms",
    "request.max_attempts",
    "request.base_delay_ms",
    "request.max_delay_ms",
    "cache.ttl_secs",
    "channel.base_delay_ms",
    "channel.max_delay_ms",
    "channel.max_reconnect_attempts",
];

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("PLOTWEAVER_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("plotweaver")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.api.enforce_env_only()?;

        if self.api.base_url.trim().is_empty() {
            return Err(anyhow!("api.base_url must not be empty"));
        }
        if self.request.timeout_ms == 0 {
            return Err(anyhow!("request.timeout_ms must be greater than zero"));
        }
        if self.request.max_attempts == 0 {
            return Err(anyhow!("request.max_attempts must be at least 1"));
        }
        if self.request.base_delay_ms > self.request.max_delay_ms {
            return Err(anyhow!(
                "request.base_delay_ms ({}) exceeds request.max_delay_ms ({})",
                self.request.base_delay_ms,
                self.request.max_delay_ms
            ));
        }
        if self.channel.max_reconnect_attempts == 0 {
            return Err(anyhow!("channel.max_reconnect_attempts must be at least 1"));
        }
        if self.channel.base_delay_ms > self.channel.max_delay_ms {
            return Err(anyhow!(
                "channel.base_delay_ms ({}) exceeds channel.max_delay_ms ({})",
                self.channel.base_delay_ms,
                self.channel.max_delay_ms
            ));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "api.base_url" => Ok(self.api.base_url.clone()),
            "api.stream_path" => Ok(self.api.stream_path.clone()),
            "api.user_id" => Ok(self.api.user_id.clone()),
            "request.timeout_ms" => Ok(self.request.timeout_ms.to_string()),
            "request.max_attempts" => Ok(self.request.max_attempts.to_string()),
            "request.base_delay_ms" => Ok(self.request.base_delay_ms.to_string()),
            "request.max_delay_ms" => Ok(self.request.max_delay_ms.to_string()),
            "cache.ttl_secs" => Ok(self.cache.ttl_secs.to_string()),
            "channel.base_delay_ms" => Ok(self.channel.base_delay_ms.to_string()),
            "channel.max_delay_ms" => Ok(self.channel.max_delay_ms.to_string()),
            "channel.max_reconnect_attempts" => Ok(self.channel.max_reconnect_attempts.to_string()),

            "api.token" | "token" => match self.api.redacted_api_token()? {
                Some(redacted) => Ok(redacted),
                None => Ok("(not set - use PLOTWEAVER_API_TOKEN env var)".to_string()),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `plotweaver config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "api.base_url" => {
                if !(value.starts_with("http://") || value.starts_with("https://")) {
                    return Err(anyhow!("api.base_url must start with http:// or https://"));
                }
                self.api.base_url = value.trim_end_matches('/').to_string();
            }
            "api.stream_path" => {
                self.api.stream_path = format!("/{}", value.trim_start_matches('/'));
            }
            "api.user_id" => {
                if value.trim().is_empty() {
                    return Err(anyhow!("api.user_id must not be empty"));
                }
                self.api.user_id = value.to_string();
            }
            "request.timeout_ms" => self.request.timeout_ms = parse_number(key, value)?,
            "request.max_attempts" => self.request.max_attempts = parse_number(key, value)?,
            "request.base_delay_ms" => self.request.base_delay_ms = parse_number(key, value)?,
            "request.max_delay_ms" => self.request.max_delay_ms = parse_number(key, value)?,
            "cache.ttl_secs" => self.cache.ttl_secs = parse_number(key, value)?,
            "channel.base_delay_ms" => self.channel.base_delay_ms = parse_number(key, value)?,
            "channel.max_delay_ms" => self.channel.max_delay_ms = parse_number(key, value)?,
            "channel.max_reconnect_attempts" => {
                self.channel.max_reconnect_attempts = parse_number(key, value)?
            }

            "api.token" | "token" => {
                return Err(anyhow!(
                    "API tokens cannot be stored in configuration for security. \
                     Set the PLOTWEAVER_API_TOKEN environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `plotweaver config list` to see available keys.",
                    key
                ));
            }
        }
        self.validate()
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        KEYS.iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

fn parse_number<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.request.timeout(), Duration::from_secs(10));
        assert_eq!(config.request.max_attempts, 3);
        assert_eq!(config.request.base_delay_ms, 1_000);
        assert_eq!(config.request.max_delay_ms, 10_000);
        assert_eq!(config.channel.max_reconnect_attempts, 5);
        assert_eq!(config.channel.max_delay_ms, 30_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_set_and_get_round_trip() {
        let mut config = Config::default();
        config.set("request.max_attempts", "5").unwrap();
        config.set("api.base_url", "https://plotweaver.example/api/").unwrap();
        config.set("api.stream_path", "events").unwrap();

        assert_eq!(config.get("request.max_attempts").unwrap(), "5");
        assert_eq!(config.get("api.base_url").unwrap(), "https://plotweaver.example/api");
        assert_eq!(config.get("api.stream_path").unwrap(), "/events");
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("request.max_attempts", "0").is_err());
        assert!(config.set("request.timeout_ms", "soon").is_err());
        assert!(config.set("api.base_url", "ftp://nope").is_err());
        assert!(config.set("api.token", "secret").is_err());
        assert!(config.set("no.such.key", "1").is_err());
    }

    #[test]
    fn test_delay_bounds_are_validated() {
        let mut config = Config::default();
        config.request.base_delay_ms = 20_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stored_token_is_rejected() {
        let mut config = Config::default();
        config.api.api_token = Some("secret".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_in_config_file_is_rejected() {
        for contents in ["[api]\napi_token = \"secret\"\n", "[api]\ntoken = \"secret\"\n"] {
            let parsed: Config = toml::from_str(contents).unwrap();
            assert_eq!(parsed.api.api_token.as_deref(), Some("secret"));
            let err = parsed.validate().unwrap_err();
            assert!(err.to_string().contains("PLOTWEAVER_API_TOKEN"));
        }
    }

    #[test]
    fn test_token_is_never_serialized() {
        let mut config = Config::default();
        config.api.api_token = Some("secret".to_string());
        let written = toml::to_string_pretty(&config).unwrap();
        assert!(!written.contains("secret"));
    }

    #[test]
    fn test_redaction_keeps_last_four_characters() {
        assert_eq!(redact_token("tok-abcdef123456"), "***3456");
        assert_eq!(redact_token("clé-secrète-ü"), "***te-ü");
        assert_eq!(redact_token("ééééé"), "***éééé");
        assert_eq!(redact_token("ü"), "***");
    }

    #[test]
    fn test_list_covers_every_key() {
        let items = Config::default().list().unwrap();
        assert_eq!(items.len(), KEYS.len());
        assert!(items.iter().any(|(k, v)| k == "cache.ttl_secs" && v == "30"));
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let parsed: Config = toml::from_str("[request]\nmax_attempts = 4\n").unwrap();
        assert_eq!(parsed.request.max_attempts, 4);
        assert_eq!(parsed.request.timeout_ms, 10_000);
        assert_eq!(parsed.channel.max_reconnect_attempts, 5);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, toml::to_string_pretty(&parsed).unwrap()).unwrap();
        let reloaded: Config = toml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded.request.max_attempts, 4);
    }
}
