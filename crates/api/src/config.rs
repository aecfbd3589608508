//! API server configuration

/// Configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations when set
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub jwt_secret: String,
    pub enable_billing: bool,
    pub run_migrations: bool,
    pub allowed_origins: Vec<String>,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    optional_env(name).ok_or(ConfigError::Missing(name))
}

fn bool_env(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(name) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value }),
        },
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let allowed_origins = optional_env("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let log_format = match optional_env("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Self {
            database_url: required_env("DATABASE_URL")?,
            database_direct_url: optional_env("DATABASE_DIRECT_URL"),
            bind_address: optional_env("BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            jwt_secret: required_env("JWT_SECRET")?,
            enable_billing: bool_env("ENABLE_BILLING", true)?,
            run_migrations: bool_env("RUN_MIGRATIONS", true)?,
            allowed_origins,
            log_format,
        })
    }

    /// Configuration for router tests, no environment involved
    #[cfg(test)]
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_url: "postgres://localhost/estate_test".to_string(),
            database_direct_url: None,
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: jwt_secret.to_string(),
            enable_billing: true,
            run_migrations: false,
            allowed_origins: vec![],
            log_format: LogFormat::Text,
        }
    }
}
