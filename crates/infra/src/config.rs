//! Process configuration read from environment variables.

use std::str::FromStr;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tracing::info;

use crate::cache::CacheSettings;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const MAX_CONNECTIONS: &str = "BUSLINE_MAX_CONNECTIONS";
pub const POLL_INTERVAL_MS: &str = "BUSLINE_POLL_INTERVAL_MS";
pub const HEARTBEAT_INTERVAL_MS: &str = "BUSLINE_HEARTBEAT_INTERVAL_MS";
pub const CATALOG_CACHE_TTL_SECS: &str = "BUSLINE_CATALOG_CACHE_TTL_SECS";
pub const CATALOG_CACHE_CAPACITY: &str = "BUSLINE_CATALOG_CACHE_CAPACITY";
pub const APPLY_SCHEMA: &str = "BUSLINE_APPLY_SCHEMA";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to connect to Postgres: {0}")]
    Connect(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    /// Unset when the process only runs against the in-memory store.
    pub database_url: Option<String>,
    pub max_connections: u32,
    /// How long a consumer sleeps after an empty poll.
    pub poll_interval: Duration,
    /// How often a running handler's claim is refreshed.
    pub heartbeat_interval: Duration,
    pub catalog_cache: CacheSettings,
    /// Run the bundled DDL on connect.
    pub apply_schema: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            poll_interval: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(5_000),
            catalog_cache: CacheSettings::default(),
            apply_schema: false,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let max_connections = parse_or(&get, MAX_CONNECTIONS, defaults.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: MAX_CONNECTIONS,
                value: "0".into(),
                reason: "pool needs at least one connection".into(),
            });
        }

        let catalog_cache = CacheSettings {
            ttl: parse_or(&get, CATALOG_CACHE_TTL_SECS, defaults.catalog_cache.ttl.as_secs())
                .map(Duration::from_secs)?,
            capacity: parse_or(
                &get,
                CATALOG_CACHE_CAPACITY,
                defaults.catalog_cache.capacity,
            )?,
        };

        Ok(Self {
            database_url: get(DATABASE_URL),
            max_connections,
            poll_interval: parse_or(
                &get,
                POLL_INTERVAL_MS,
                defaults.poll_interval.as_millis() as u64,
            )
            .map(Duration::from_millis)?,
            heartbeat_interval: parse_or(
                &get,
                HEARTBEAT_INTERVAL_MS,
                defaults.heartbeat_interval.as_millis() as u64,
            )
            .map(Duration::from_millis)?,
            catalog_cache,
            apply_schema: parse_flag(&get, APPLY_SCHEMA, defaults.apply_schema)?,
        })
    }

    /// Open the Postgres pool (and apply the schema when configured).
    pub async fn connect(&self) -> Result<PgPool, ConfigError> {
        let url = self
            .database_url
            .as_deref()
            .ok_or(ConfigError::Missing(DATABASE_URL))?;

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|e| ConfigError::Connect(e.to_string()))?;

        if self.apply_schema {
            crate::schema::apply(&pool)
                .await
                .map_err(|e| ConfigError::Connect(e.to_string()))?;
        }

        info!(
            max_connections = self.max_connections,
            apply_schema = self.apply_schema,
            "connected to Postgres"
        );
        Ok(pool)
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_flag<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".into(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = BusConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, BusConfig::default());
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.catalog_cache.capacity, 1024);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = BusConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://bus@localhost/bus"),
            (MAX_CONNECTIONS, "4"),
            (POLL_INTERVAL_MS, "50"),
            (HEARTBEAT_INTERVAL_MS, "1000"),
            (CATALOG_CACHE_TTL_SECS, "5"),
            (CATALOG_CACHE_CAPACITY, "16"),
            (APPLY_SCHEMA, "true"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://bus@localhost/bus"));
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.catalog_cache.ttl, Duration::from_secs(5));
        assert_eq!(config.catalog_cache.capacity, 16);
        assert!(config.apply_schema);
    }

    #[test]
    fn bad_values_name_the_key() {
        let err = BusConfig::from_lookup(lookup(&[(POLL_INTERVAL_MS, "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: POLL_INTERVAL_MS, .. }));

        let err = BusConfig::from_lookup(lookup(&[(APPLY_SCHEMA, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: APPLY_SCHEMA, .. }));

        let err = BusConfig::from_lookup(lookup(&[(MAX_CONNECTIONS, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: MAX_CONNECTIONS, .. }));
    }

    #[tokio::test]
    async fn connect_requires_a_database_url() {
        let err = BusConfig::default().connect().await.unwrap_err();
        assert_eq!(err, ConfigError::Missing(DATABASE_URL));
    }
}
