use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogLevel;

pub const DEFAULT_BACKEND_URL: &str = "https://api.reclaimprotocol.org";
pub const DEFAULT_ATTESTOR_URL: &str = "wss://attestor.reclaimprotocol.org/ws";
pub const DEFAULT_GEO_LOOKUP_URL: &str = "https://ipapi.co/country/";

/// Top-level configuration of the orchestrator and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub backend: BackendConfig,
    pub timeouts: TimeoutPolicy,
    pub filter: FilterPolicy,
    pub tabs: TabPolicy,
    pub log_level: LogLevel,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            timeouts: TimeoutPolicy::default(),
            filter: FilterPolicy::default(),
            tabs: TabPolicy::default(),
            log_level: LogLevel::Info,
        }
    }
}

/// Remote endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub attestor_url: String,
    pub geo_lookup_url: String,
    pub request_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BACKEND_URL.to_string(),
            attestor_url: DEFAULT_ATTESTOR_URL.to_string(),
            geo_lookup_url: DEFAULT_GEO_LOOKUP_URL.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Bounds on every wait the session can get stuck in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Idle watchdog; fails the session when no claim makes progress.
    pub session: Duration,
    pub attestation: Duration,
    pub private_key: Duration,
    pub parameters: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            session: Duration::from_secs(30),
            attestation: Duration::from_secs(60),
            private_key: Duration::from_secs(10),
            parameters: Duration::from_secs(5),
        }
    }
}

/// Content-side network filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterPolicy {
    pub scan_interval: Duration,
    pub max_duration: Duration,
    pub retention: Duration,
}

impl Default for FilterPolicy {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            max_duration: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(2 * 60),
        }
    }
}

/// Delays before verification tabs are cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabPolicy {
    pub close_after_submit: Duration,
    pub close_after_cancel: Duration,
}

impl Default for TabPolicy {
    fn default() -> Self {
        Self {
            close_after_submit: Duration::from_secs(3),
            close_after_cancel: Duration::from_secs(1),
        }
    }
}

impl OrchestratorConfig {
    /// Reads `RECLAIM_*` variables from the process environment. When
    /// `RECLAIM_CONFIG_PATH` names a file of `KEY=value` lines, those are read
    /// first and the environment overrides them.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut kv = HashMap::new();
        if let Ok(path) = std::env::var("RECLAIM_CONFIG_PATH") {
            let raw = std::fs::read_to_string(&path).map_err(|err| ConfigError::Unreadable {
                path: path.clone(),
                reason: err.to_string(),
            })?;
            kv.extend(parse_env_file(&raw));
        }
        kv.extend(std::env::vars().filter(|(key, _)| key.starts_with("RECLAIM_")));
        Self::from_kv(&kv)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = kv.get("RECLAIM_BACKEND_URL") {
            config.backend.base_url = url_value("RECLAIM_BACKEND_URL", value)?;
        }
        if let Some(value) = kv.get("RECLAIM_ATTESTOR_URL") {
            config.backend.attestor_url = url_value("RECLAIM_ATTESTOR_URL", value)?;
        }
        if let Some(value) = kv.get("RECLAIM_GEO_LOOKUP_URL") {
            config.backend.geo_lookup_url = url_value("RECLAIM_GEO_LOOKUP_URL", value)?;
        }

        let durations: [(&'static str, &mut Duration); 10] = [
            ("RECLAIM_HTTP_TIMEOUT_MS", &mut config.backend.request_timeout),
            ("RECLAIM_SESSION_TIMEOUT_MS", &mut config.timeouts.session),
            ("RECLAIM_ATTESTATION_TIMEOUT_MS", &mut config.timeouts.attestation),
            ("RECLAIM_PRIVATE_KEY_TIMEOUT_MS", &mut config.timeouts.private_key),
            ("RECLAIM_PARAMETERS_TIMEOUT_MS", &mut config.timeouts.parameters),
            ("RECLAIM_FILTER_INTERVAL_MS", &mut config.filter.scan_interval),
            ("RECLAIM_FILTER_TIMEOUT_MS", &mut config.filter.max_duration),
            ("RECLAIM_BUFFER_RETENTION_MS", &mut config.filter.retention),
            ("RECLAIM_TAB_CLOSE_AFTER_SUBMIT_MS", &mut config.tabs.close_after_submit),
            ("RECLAIM_TAB_CLOSE_AFTER_CANCEL_MS", &mut config.tabs.close_after_cancel),
        ];
        for (key, slot) in durations {
            if let Some(value) = kv.get(key) {
                *slot = millis_value(key, value)?;
            }
        }

        if let Some(value) = kv.get("RECLAIM_LOG_LEVEL") {
            config.log_level = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RECLAIM_LOG_LEVEL",
                value: value.clone(),
                reason: "expected error, warn, info, debug or trace",
            })?;
        }

        Ok(config)
    }
}

fn url_value(key: &'static str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim().trim_end_matches('/');
    url::Url::parse(trimmed).map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: "not an absolute url",
    })?;
    Ok(trimmed.to_string())
}

fn millis_value(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be positive",
        }),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected milliseconds",
        }),
    }
}

fn parse_env_file(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.timeouts.session, Duration::from_secs(30));
        assert_eq!(config.timeouts.attestation, Duration::from_secs(60));
        assert_eq!(config.timeouts.private_key, Duration::from_secs(10));
        assert_eq!(config.filter.max_duration, Duration::from_secs(600));
        assert_eq!(config.filter.retention, Duration::from_secs(120));
        assert_eq!(config.tabs.close_after_submit, Duration::from_secs(3));
        assert_eq!(config.tabs.close_after_cancel, Duration::from_secs(1));
        assert_eq!(config.backend.base_url, DEFAULT_BACKEND_URL);
    }

    #[test]
    fn test_overrides_from_kv() {
        let config = OrchestratorConfig::from_kv(&kv(&[
            ("RECLAIM_BACKEND_URL", "http://localhost:8080/"),
            ("RECLAIM_SESSION_TIMEOUT_MS", "1500"),
            ("RECLAIM_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.backend.base_url, "http://localhost:8080");
        assert_eq!(config.timeouts.session, Duration::from_millis(1500));
        assert_eq!(config.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_malformed_values_rejected() {
        let err = OrchestratorConfig::from_kv(&kv(&[("RECLAIM_SESSION_TIMEOUT_MS", "30s")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "RECLAIM_SESSION_TIMEOUT_MS",
                ..
            }
        ));

        assert!(OrchestratorConfig::from_kv(&kv(&[("RECLAIM_FILTER_TIMEOUT_MS", "0")])).is_err());
        assert!(OrchestratorConfig::from_kv(&kv(&[("RECLAIM_BACKEND_URL", "not a url")])).is_err());
        assert!(OrchestratorConfig::from_kv(&kv(&[("RECLAIM_LOG_LEVEL", "loud")])).is_err());
    }

    #[test]
    fn test_env_file_lines() {
        let parsed = parse_env_file("# comment\nRECLAIM_LOG_LEVEL=\"warn\"\n\nBROKEN\n");

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed["RECLAIM_LOG_LEVEL"], "warn");
    }
}
