use std::collections::HashMap;

use tracing::debug;

use crate::error::ConfigError;

const DEFAULT_PROXY_HOST: &str = "0.0.0.0";
const DEFAULT_PROXY_PORT: u16 = 7788;
const DEFAULT_RESUME_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DB_PATH: &str = "./serverbox.db";

/// Fully-resolved process configuration, the sole output of reading
/// `SERVERBOX_*`/`DAYTONA_*` from the environment. Every other crate takes
/// its configuration as plain values from here rather than touching
/// `std::env` itself.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub admin_api_key: String,
    pub proxy_api_key: Option<String>,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub auto_resume: bool,
    pub resume_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub request_logs: bool,
    pub log_level: String,
    pub db_path: String,
    pub daytona_api_key: Option<String>,
    pub daytona_api_url: Option<String>,
    pub daytona_target: Option<String>,
    /// Raw process environment snapshot, passed through to the auth
    /// normalizer and bootstrap env assembly — the only other place in the
    /// system that reads ambient environment values.
    pub process_env: HashMap<String, String>,
}

impl ProxyConfig {
    /// Read and validate configuration from the real process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    /// Pure, testable variant of [`Self::from_env`] taking an explicit
    /// environment snapshot instead of reading the process's.
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let admin_api_key = require(vars, "SERVERBOX_ADMIN_API_KEY")?;

        let proxy_api_key = match optional(vars, "SERVERBOX_PROXY_API_KEY") {
            Some(k) if k.is_empty() => None,
            Some(k) => Some(k),
            None => Some(admin_api_key.clone()),
        };

        let proxy_host = optional(vars, "SERVERBOX_PROXY_HOST")
            .unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string());
        let proxy_port = parse_u16(vars, "SERVERBOX_PROXY_PORT", DEFAULT_PROXY_PORT)?;
        let auto_resume = parse_bool(vars, "SERVERBOX_PROXY_AUTO_RESUME", true)?;
        let resume_timeout_ms = parse_u64(
            vars,
            "SERVERBOX_PROXY_RESUME_TIMEOUT_MS",
            DEFAULT_RESUME_TIMEOUT_MS,
        )?;
        let request_timeout_ms = parse_u64(
            vars,
            "SERVERBOX_PROXY_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?;
        let request_logs = parse_bool(vars, "SERVERBOX_PROXY_REQUEST_LOGS", false)?;
        let log_level =
            optional(vars, "SERVERBOX_LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        let db_path =
            optional(vars, "SERVERBOX_DB_PATH").unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let daytona_api_key = optional(vars, "DAYTONA_API_KEY");
        if daytona_api_key.is_none() {
            debug!("DAYTONA_API_KEY not set; live sandbox creation will be unavailable");
        }
        let daytona_api_url = optional(vars, "DAYTONA_API_URL");
        let daytona_target = optional(vars, "DAYTONA_TARGET");

        Ok(ProxyConfig {
            admin_api_key,
            proxy_api_key,
            proxy_host,
            proxy_port,
            auto_resume,
            resume_timeout_ms,
            request_timeout_ms,
            request_logs,
            log_level,
            db_path,
            daytona_api_key,
            daytona_api_url,
            daytona_target,
            process_env: vars.clone(),
        })
    }
}

fn optional(vars: &HashMap<String, String>, key: &str) -> Option<String> {
    vars.get(key).cloned()
}

fn require(vars: &HashMap<String, String>, key: &str) -> Result<String, ConfigError> {
    optional(vars, key).ok_or_else(|| ConfigError::MissingRequired(key.to_string()))
}

fn parse_bool(vars: &HashMap<String, String>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional(vars, key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                var: key.to_string(),
                value: v,
                message: "expected true|false".to_string(),
            }),
        },
    }
}

fn parse_u16(vars: &HashMap<String, String>, key: &str, default: u16) -> Result<u16, ConfigError> {
    match optional(vars, key) {
        None => Ok(default),
        Some(v) => v.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
            var: key.to_string(),
            value: v,
            message: e.to_string(),
        }),
    }
}

fn parse_u64(vars: &HashMap<String, String>, key: &str, default: u64) -> Result<u64, ConfigError> {
    match optional(vars, key) {
        None => Ok(default),
        Some(v) => v.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
            var: key.to_string(),
            value: v,
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("SERVERBOX_ADMIN_API_KEY".to_string(), "admin-key".to_string());
        m
    }

    #[test]
    fn missing_admin_key_fails() {
        let err = ProxyConfig::from_map(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(var) if var == "SERVERBOX_ADMIN_API_KEY"));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ProxyConfig::from_map(&base_env()).unwrap();
        assert_eq!(cfg.proxy_host, DEFAULT_PROXY_HOST);
        assert_eq!(cfg.proxy_port, DEFAULT_PROXY_PORT);
        assert!(cfg.auto_resume);
        assert_eq!(cfg.proxy_api_key.as_deref(), Some("admin-key"));
    }

    #[test]
    fn empty_proxy_key_disables_proxy_auth() {
        let mut env = base_env();
        env.insert("SERVERBOX_PROXY_API_KEY".to_string(), String::new());
        let cfg = ProxyConfig::from_map(&env).unwrap();
        assert_eq!(cfg.proxy_api_key, None);
    }

    #[test]
    fn explicit_proxy_key_overrides_admin_key() {
        let mut env = base_env();
        env.insert("SERVERBOX_PROXY_API_KEY".to_string(), "proxy-key".to_string());
        let cfg = ProxyConfig::from_map(&env).unwrap();
        assert_eq!(cfg.proxy_api_key.as_deref(), Some("proxy-key"));
    }

    #[test]
    fn invalid_port_is_rejected() {
        let mut env = base_env();
        env.insert("SERVERBOX_PROXY_PORT".to_string(), "not-a-port".to_string());
        let err = ProxyConfig::from_map(&env).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
