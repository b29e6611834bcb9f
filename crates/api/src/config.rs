//! Server configuration loaded from the environment

use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_REMOTE_FETCH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// When false the Stripe-backed services are never constructed
    pub enable_billing: bool,
    /// Bearer token for /admin routes; admin routes reject everything when unset
    pub admin_api_token: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Upper bound on live processor lookups during membership aggregation
    pub remote_fetch_timeout: Duration,
    pub run_migrations: bool,
    pub log_format: LogFormat,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"[redacted]")
            .field("bind_address", &self.bind_address)
            .field("enable_billing", &self.enable_billing)
            .field(
                "admin_api_token",
                &self.admin_api_token.as_ref().map(|_| "[redacted]"),
            )
            .field("allowed_origins", &self.allowed_origins)
            .field("remote_fetch_timeout", &self.remote_fetch_timeout)
            .field("run_migrations", &self.run_migrations)
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value: raw }),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string());

        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        let remote_fetch_timeout = match std::env::var("REMOTE_FETCH_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                ConfigError::Invalid {
                    name: "REMOTE_FETCH_TIMEOUT_SECS",
                    value: raw.clone(),
                }
            })?),
            Err(_) => Duration::from_secs(DEFAULT_REMOTE_FETCH_TIMEOUT_SECS),
        };

        let log_format = match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            database_url,
            bind_address,
            enable_billing: env_bool("ENABLE_BILLING", true)?,
            admin_api_token,
            allowed_origins,
            remote_fetch_timeout,
            run_migrations: env_bool("RUN_MIGRATIONS", true)?,
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "BIND_ADDRESS",
        "ENABLE_BILLING",
        "ADMIN_API_TOKEN",
        "ALLOWED_ORIGINS",
        "REMOTE_FETCH_TIMEOUT_SECS",
        "RUN_MIGRATIONS",
        "LOG_FORMAT",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/donorledger");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.enable_billing);
        assert!(config.run_migrations);
        assert!(config.admin_api_token.is_none());
        assert_eq!(config.remote_fetch_timeout, Duration::from_secs(5));
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.log_format, LogFormat::Pretty);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        clear_env();
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Missing("DATABASE_URL"))
        ));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/donorledger");
        std::env::set_var("ENABLE_BILLING", "false");
        std::env::set_var("ADMIN_API_TOKEN", "admin-secret");
        std::env::set_var("ALLOWED_ORIGINS", "https://give.example.org, ");
        std::env::set_var("REMOTE_FETCH_TIMEOUT_SECS", "2");
        std::env::set_var("LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();
        assert!(!config.enable_billing);
        assert_eq!(config.admin_api_token.as_deref(), Some("admin-secret"));
        assert_eq!(config.allowed_origins, vec!["https://give.example.org"]);
        assert_eq!(config.remote_fetch_timeout, Duration::from_secs(2));
        assert_eq!(config.log_format, LogFormat::Json);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/donorledger");
        std::env::set_var("RUN_MIGRATIONS", "sometimes");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid {
                name: "RUN_MIGRATIONS",
                ..
            })
        ));

        std::env::set_var("RUN_MIGRATIONS", "true");
        std::env::set_var("REMOTE_FETCH_TIMEOUT_SECS", "soon");
        assert!(Config::from_env().is_err());

        clear_env();
    }
}
