//! Configuration for the allocator service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use crpark_reconcile::{BackoffPolicy, DEFAULT_RECONNECT_DELAY};

use crate::listener::ListenerConfig;
use crate::protocol::AllocatorConfig;
use crate::scoring::{ScoreWeights, ScoringConfig};
use crate::state::{HistoryRetention, DEFAULT_SESSION_TTL};

/// Allocator service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API bind address.
    pub listen_addr: SocketAddr,

    /// NDJSON event feed. Without one the cache is never reconciled.
    pub feed_url: Option<String>,

    /// Base URL of the commit endpoint.
    pub commit_url: String,

    /// Directory holding `session.db`.
    pub data_dir: PathBuf,

    /// Pool seed loaded at start.
    pub pools_file: Option<PathBuf>,

    pub commit_timeout: Duration,
    pub feed_retry: Duration,
    pub session_ttl: Duration,

    /// How long an idle allocation session stays in memory.
    pub session_idle: Duration,

    pub retention: HistoryRetention,
    pub weights: ScoreWeights,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr = parse_or(&lookup, "CRPARK_LISTEN_ADDR", || {
            SocketAddr::from(([127, 0, 0, 1], 8080))
        })?;

        let feed_url = lookup("CRPARK_FEED_URL").filter(|s| !s.is_empty());

        let commit_url = lookup("CRPARK_COMMIT_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8000".to_string());

        let data_dir = lookup("CRPARK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/crpark"));

        let pools_file = lookup("CRPARK_POOLS_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let commit_timeout =
            Duration::from_millis(parse_or(&lookup, "CRPARK_COMMIT_TIMEOUT_MS", || 5000)?);
        let feed_retry = Duration::from_secs(parse_or(&lookup, "CRPARK_FEED_RETRY_SECS", || {
            DEFAULT_RECONNECT_DELAY.as_secs()
        })?);
        let session_ttl = Duration::from_secs(parse_or(&lookup, "CRPARK_SESSION_TTL_SECS", || {
            DEFAULT_SESSION_TTL.as_secs()
        })?);

        let session_idle =
            Duration::from_secs(parse_or(&lookup, "CRPARK_SESSION_IDLE_SECS", || 30 * 60)?);

        let retention = HistoryRetention {
            max_entries: parse_opt(&lookup, "CRPARK_HISTORY_MAX_ENTRIES")?,
            max_age: parse_opt::<i64, _>(&lookup, "CRPARK_HISTORY_MAX_AGE_HOURS")?
                .map(chrono::Duration::hours),
        };

        let defaults = ScoreWeights::default();
        let weights = ScoreWeights {
            distance: parse_or(&lookup, "CRPARK_WEIGHT_DISTANCE", || defaults.distance)?,
            availability: parse_or(&lookup, "CRPARK_WEIGHT_AVAILABILITY", || {
                defaults.availability
            })?,
            cost: parse_or(&lookup, "CRPARK_WEIGHT_COST", || defaults.cost)?,
            waiting: parse_or(&lookup, "CRPARK_WEIGHT_WAITING", || defaults.waiting)?,
            competition: parse_or(&lookup, "CRPARK_WEIGHT_COMPETITION", || {
                defaults.competition
            })?,
        };
        weights.validate().context("invalid scoring weights")?;

        let log_level = lookup("CRPARK_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            feed_url,
            commit_url,
            data_dir,
            pools_file,
            commit_timeout,
            feed_retry,
            session_ttl,
            session_idle,
            retention,
            weights,
            log_level,
        })
    }

    /// Path of the session database.
    pub fn session_db_path(&self) -> PathBuf {
        self.data_dir.join("session.db")
    }

    pub fn allocator_config(&self) -> AllocatorConfig {
        AllocatorConfig {
            scoring: ScoringConfig {
                weights: self.weights,
                ..ScoringConfig::default()
            },
            commit_timeout: self.commit_timeout,
            session_idle_ttl: self.session_idle,
            ..AllocatorConfig::default()
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            reconnect: BackoffPolicy::fixed(self.feed_retry),
        }
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: impl FnOnce() -> T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, key)?.unwrap_or_else(default))
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
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.feed_url, None);
        assert_eq!(config.commit_url, "http://127.0.0.1:8000");
        assert_eq!(config.session_db_path(), PathBuf::from("/var/lib/crpark/session.db"));
        assert_eq!(config.commit_timeout, Duration::from_secs(5));
        assert_eq!(config.feed_retry, Duration::from_secs(3));
        assert_eq!(config.session_ttl, Duration::from_secs(1800));
        assert_eq!(config.allocator_config().session_idle_ttl, Duration::from_secs(1800));
        assert!(config.retention.is_unbounded());
        assert_eq!(config.weights, ScoreWeights::default());
        assert_eq!(config.log_level, "info");
        assert_eq!(config.allocator_config().max_fallback_attempts, 3);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CRPARK_FEED_URL", "http://feed.local/events"),
            ("CRPARK_COMMIT_TIMEOUT_MS", "250"),
            ("CRPARK_HISTORY_MAX_ENTRIES", "10"),
            ("CRPARK_HISTORY_MAX_AGE_HOURS", "48"),
            ("CRPARK_FEED_RETRY_SECS", "1"),
            ("CRPARK_SESSION_IDLE_SECS", "120"),
        ])
        .unwrap();

        assert_eq!(config.feed_url.as_deref(), Some("http://feed.local/events"));
        assert_eq!(config.allocator_config().commit_timeout, Duration::from_millis(250));
        assert_eq!(config.allocator_config().session_idle_ttl, Duration::from_secs(120));
        assert_eq!(config.retention.max_entries, Some(10));
        assert_eq!(config.retention.max_age, Some(chrono::Duration::hours(48)));
        assert_eq!(
            config.listener_config().reconnect,
            BackoffPolicy::fixed(Duration::from_secs(1))
        );
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let err = load(&[("CRPARK_WEIGHT_DISTANCE", "0.5")]).unwrap_err();
        assert!(err.to_string().contains("scoring weights"));

        let config = load(&[
            ("CRPARK_WEIGHT_DISTANCE", "0.35"),
            ("CRPARK_WEIGHT_COMPETITION", "0.0"),
        ])
        .unwrap();
        assert_eq!(config.weights.distance, 0.35);
    }

    #[test]
    fn test_unparseable_value_is_an_error() {
        let err = load(&[("CRPARK_COMMIT_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("CRPARK_COMMIT_TIMEOUT_MS"));
    }
}
