//! Configuration loaded from environment variables

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::orm::DEFAULT_EAGER_DEPTH;

/// Connection settings for the SQLite pool
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection URL (e.g. `sqlite://data/joinery.db` or `sqlite::memory:`)
    pub url: String,

    /// Pool size for file-backed databases
    pub max_connections: u32,

    /// Upper bound for a single statement
    pub query_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Log output format for the tracing subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,

    /// How many levels of eager relations are joined automatically
    pub eager_depth: usize,

    /// Drop every registered table on startup
    pub drop_schema: bool,

    /// Create missing tables and columns on startup
    pub synchronize: bool,

    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            eager_depth: DEFAULT_EAGER_DEPTH,
            drop_schema: true,
            synchronize: true,
            log_format: LogFormat::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // DATABASE_PATH wins over DATABASE_URL; a bare path gets the sqlite: prefix
        let url = lookup("DATABASE_PATH")
            .or_else(|| lookup("DATABASE_URL"))
            .map(|v| {
                if v.starts_with("sqlite:") {
                    v
                } else {
                    format!("sqlite://{}", v)
                }
            })
            .unwrap_or(defaults.database.url);

        let max_connections = match lookup("DATABASE_MAX_CONNECTIONS") {
            Some(v) => v.parse().context("Invalid DATABASE_MAX_CONNECTIONS")?,
            None => defaults.database.max_connections,
        };

        let query_timeout = match lookup("JOINERY_QUERY_TIMEOUT_SECS") {
            Some(v) => Duration::from_secs(v.parse().context("Invalid JOINERY_QUERY_TIMEOUT_SECS")?),
            None => defaults.database.query_timeout,
        };

        let eager_depth = match lookup("JOINERY_EAGER_DEPTH") {
            Some(v) => v.parse().context("Invalid JOINERY_EAGER_DEPTH")?,
            None => defaults.eager_depth,
        };

        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            Some("pretty") | None => LogFormat::Pretty,
            Some(other) => anyhow::bail!("Invalid LOG_FORMAT: {}", other),
        };

        Ok(Self {
            database: DatabaseConfig {
                url,
                max_connections,
                query_timeout,
            },
            eager_depth,
            drop_schema: lookup("JOINERY_DROP_SCHEMA")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.drop_schema),
            synchronize: lookup("JOINERY_SYNCHRONIZE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.synchronize),
            log_format,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.database.query_timeout, Duration::from_secs(30));
        assert_eq!(config.eager_depth, 1);
        assert!(config.drop_schema);
        assert!(config.synchronize);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "sqlite://ignored.db"),
            ("DATABASE_PATH", "./data/joinery.db"),
            ("JOINERY_QUERY_TIMEOUT_SECS", "2"),
            ("JOINERY_EAGER_DEPTH", "3"),
            ("JOINERY_DROP_SCHEMA", "false"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.database.url, "sqlite://./data/joinery.db");
        assert_eq!(config.database.query_timeout, Duration::from_secs(2));
        assert_eq!(config.eager_depth, 3);
        assert!(!config.drop_schema);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values() {
        assert!(load(&[("DATABASE_MAX_CONNECTIONS", "many")]).is_err());
        assert!(load(&[("LOG_FORMAT", "xml")]).is_err());
    }
}
