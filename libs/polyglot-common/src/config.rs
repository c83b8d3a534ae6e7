// Process-level configuration, read from the environment

use crate::types::{DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_MS};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// What a rate-limit window is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKey {
    /// Peer IP address
    Ip,
    /// `x-api-key` header, falling back to the peer IP when absent
    ApiKey,
    /// One window shared by every caller
    Global,
}

impl FromStr for RateLimitKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ip" => Ok(RateLimitKey::Ip),
            "api-key" | "api_key" | "apikey" => Ok(RateLimitKey::ApiKey),
            "global" => Ok(RateLimitKey::Global),
            other => Err(format!("expected ip, api-key or global, got {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window: Duration,
    pub key: RateLimitKey,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            key: RateLimitKey::Ip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected text or json, got {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub languages_config: PathBuf,
    pub scratch_dir: PathBuf,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub rate_limit: RateLimitConfig,
    pub js_loop_iteration_limit: u64,
    /// Program re-executed to evaluate JavaScript; the running binary when unset
    pub js_worker_program: Option<PathBuf>,
    /// Combined stdout and stderr an execution may produce before it is killed
    pub max_output_bytes: usize,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            languages_config: PathBuf::from("config/languages.json"),
            scratch_dir: std::env::temp_dir().join("polyglot"),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_timeout_ms: 120_000,
            rate_limit: RateLimitConfig::default(),
            js_loop_iteration_limit: 50_000_000,
            js_worker_program: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            log_format: LogFormat::Text,
        }
    }
}

impl ServerConfig {
    /// Build configuration from environment variables, using defaults for
    /// anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ServerConfig::from_env`] with an injectable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let rate_limit = RateLimitConfig {
            max_requests: parse_or(&lookup, "RATE_LIMIT_MAX_REQUESTS", defaults.rate_limit.max_requests)?,
            window: Duration::from_secs(parse_or(
                &lookup,
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit.window.as_secs(),
            )?),
            key: parse_or(&lookup, "RATE_LIMIT_KEY", defaults.rate_limit.key)?,
        };

        let config = Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            languages_config: lookup("LANGUAGES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.languages_config),
            scratch_dir: lookup("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            default_timeout_ms: parse_or(&lookup, "DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms)?,
            max_timeout_ms: parse_or(&lookup, "MAX_TIMEOUT_MS", defaults.max_timeout_ms)?,
            rate_limit,
            js_loop_iteration_limit: parse_or(
                &lookup,
                "JS_LOOP_ITERATION_LIMIT",
                defaults.js_loop_iteration_limit,
            )?,
            js_worker_program: lookup("JS_WORKER_PROGRAM").map(PathBuf::from),
            max_output_bytes: parse_or(&lookup, "MAX_OUTPUT_BYTES", defaults.max_output_bytes)?,
            log_format: parse_or(&lookup, "LOG_FORMAT", defaults.log_format)?,
        };

        if config.max_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_TIMEOUT_MS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if config.max_output_bytes == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_OUTPUT_BYTES",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_empty() {
        let config = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.rate_limit.max_requests, 30);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.key, RateLimitKey::Ip);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(config.js_worker_program, None);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("BIND_ADDR", "127.0.0.1:8080"),
            ("RATE_LIMIT_MAX_REQUESTS", "5"),
            ("RATE_LIMIT_KEY", "global"),
            ("LOG_FORMAT", "json"),
            ("SCRATCH_DIR", "/var/tmp/runs"),
            ("MAX_OUTPUT_BYTES", "4096"),
            ("JS_WORKER_PROGRAM", "/usr/local/bin/polyglot-js-worker"),
        ]))
        .unwrap();
        assert_eq!(config.max_output_bytes, 4096);
        assert_eq!(
            config.js_worker_program,
            Some(PathBuf::from("/usr/local/bin/polyglot-js-worker"))
        );
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.rate_limit.key, RateLimitKey::Global);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.scratch_dir, PathBuf::from("/var/tmp/runs"));
    }

    #[test]
    fn test_invalid_value_names_the_key() {
        let err = ServerConfig::from_lookup(lookup_from(&[("MAX_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("MAX_TIMEOUT_MS"));

        let err = ServerConfig::from_lookup(lookup_from(&[("RATE_LIMIT_KEY", "cookie")])).unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_KEY"));
    }

    #[test]
    fn test_zero_max_timeout_rejected() {
        assert!(ServerConfig::from_lookup(lookup_from(&[("MAX_TIMEOUT_MS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup_from(&[("MAX_OUTPUT_BYTES", "0")])).is_err());
    }
}
