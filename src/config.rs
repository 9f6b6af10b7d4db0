use std::env;

use anyhow::{anyhow, Result};

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub detector_url: String,
    pub store_url: String,
    pub provider_url: String,
    pub provider_api_key: String,
    pub detector_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub provider_timeout_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub rate_limit_sweep_secs: u64,
    pub max_request_bytes: Option<usize>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            detector_url: "http://localhost:8081".to_string(),
            store_url: "http://localhost:8082".to_string(),
            provider_url: "https://api.anthropic.com".to_string(),
            provider_api_key: String::new(),
            detector_timeout_ms: 10_000,
            store_timeout_ms: 10_000,
            provider_timeout_ms: 60_000,
            rate_limit_max: 100,
            rate_limit_window_ms: 1_000,
            rate_limit_sweep_secs: 60,
            max_request_bytes: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let port = match parse_optional_u64("PORT")? {
            Some(value) => u16::try_from(value).map_err(|_| anyhow!("PORT must fit in a u16"))?,
            None => defaults.port,
        };
        let rate_limit_max = match parse_optional_u64("RATE_LIMIT_MAX")? {
            Some(value) => {
                u32::try_from(value).map_err(|_| anyhow!("RATE_LIMIT_MAX must fit in a u32"))?
            }
            None => defaults.rate_limit_max,
        };

        Ok(Self {
            port,
            detector_url: env_or("NER_SERVICE_URL", defaults.detector_url),
            store_url: env_or("VAULT_SERVICE_URL", defaults.store_url),
            provider_url: env_or("LLM_PROVIDER_URL", defaults.provider_url),
            provider_api_key: env_or("LLM_API_KEY", defaults.provider_api_key),
            detector_timeout_ms: parse_optional_u64("NER_TIMEOUT_MS")?
                .unwrap_or(defaults.detector_timeout_ms),
            store_timeout_ms: parse_optional_u64("VAULT_TIMEOUT_MS")?
                .unwrap_or(defaults.store_timeout_ms),
            provider_timeout_ms: parse_optional_u64("LLM_TIMEOUT_MS")?
                .unwrap_or(defaults.provider_timeout_ms),
            rate_limit_max,
            rate_limit_window_ms: parse_optional_u64("RATE_LIMIT_WINDOW_MS")?
                .unwrap_or(defaults.rate_limit_window_ms),
            rate_limit_sweep_secs: parse_optional_u64("RATE_LIMIT_SWEEP_SECS")?
                .unwrap_or(defaults.rate_limit_sweep_secs),
            max_request_bytes: parse_optional_u64("MAX_REQUEST_BYTES")?.map(|v| v as usize),
        })
    }
}

fn env_or(var: &str, default: String) -> String {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default,
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_VARS: [&str; 12] = [
        "PORT",
        "NER_SERVICE_URL",
        "VAULT_SERVICE_URL",
        "LLM_PROVIDER_URL",
        "LLM_API_KEY",
        "NER_TIMEOUT_MS",
        "VAULT_TIMEOUT_MS",
        "LLM_TIMEOUT_MS",
        "RATE_LIMIT_MAX",
        "RATE_LIMIT_WINDOW_MS",
        "RATE_LIMIT_SWEEP_SECS",
        "MAX_REQUEST_BYTES",
    ];

    fn clear_env() {
        for var in ALL_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.detector_url, "http://localhost:8081");
        assert_eq!(cfg.store_url, "http://localhost:8082");
        assert_eq!(cfg.provider_url, "https://api.anthropic.com");
        assert!(cfg.provider_api_key.is_empty());
        assert_eq!(cfg.detector_timeout_ms, 10_000);
        assert_eq!(cfg.provider_timeout_ms, 60_000);
        assert_eq!(cfg.rate_limit_max, 100);
        assert_eq!(cfg.rate_limit_window_ms, 1_000);
        assert_eq!(cfg.rate_limit_sweep_secs, 60);
        assert!(cfg.max_request_bytes.is_none());
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();

        std::env::set_var("PORT", "9090");
        std::env::set_var("NER_SERVICE_URL", "http://ner.internal:9000");
        std::env::set_var("VAULT_SERVICE_URL", "http://vault.internal:9001");
        std::env::set_var("LLM_PROVIDER_URL", "https://llm.internal");
        std::env::set_var("LLM_API_KEY", "sk-test");
        std::env::set_var("NER_TIMEOUT_MS", "2500");
        std::env::set_var("VAULT_TIMEOUT_MS", "3500");
        std::env::set_var("LLM_TIMEOUT_MS", "45000");
        std::env::set_var("RATE_LIMIT_MAX", "7");
        std::env::set_var("RATE_LIMIT_WINDOW_MS", "250");
        std::env::set_var("RATE_LIMIT_SWEEP_SECS", "5");
        std::env::set_var("MAX_REQUEST_BYTES", "2048");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.detector_url, "http://ner.internal:9000");
        assert_eq!(cfg.store_url, "http://vault.internal:9001");
        assert_eq!(cfg.provider_url, "https://llm.internal");
        assert_eq!(cfg.provider_api_key, "sk-test");
        assert_eq!(cfg.detector_timeout_ms, 2500);
        assert_eq!(cfg.store_timeout_ms, 3500);
        assert_eq!(cfg.provider_timeout_ms, 45000);
        assert_eq!(cfg.rate_limit_max, 7);
        assert_eq!(cfg.rate_limit_window_ms, 250);
        assert_eq!(cfg.rate_limit_sweep_secs, 5);
        assert_eq!(cfg.max_request_bytes, Some(2048));

        clear_env();
    }

    #[test]
    fn rejects_non_numeric_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();

        std::env::set_var("RATE_LIMIT_MAX", "banana");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("RATE_LIMIT_MAX");

        std::env::set_var("PORT", "70000");
        assert!(AppConfig::from_env().is_err());
        std::env::remove_var("PORT");
    }
}
