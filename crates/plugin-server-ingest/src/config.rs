//! Worker configuration loaded from environment variables.

use crate::{Error, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Spool roots the queue reads from, in priority order.
    pub queue_hosts: Vec<PathBuf>,

    /// Topic consumed by the workers.
    pub consumer_topic: String,

    /// Topic processed events are written to.
    pub producer_topic: String,

    /// Topic dead letters are written to.
    pub dead_letter_topic: String,

    /// JSON document with per-team plugin chains.
    pub plugin_config_path: PathBuf,

    /// SQLite database holding `posthog_team_eventpropfilter`.
    pub database_path: PathBuf,

    /// Number of concurrent ingestion workers.
    pub worker_count: usize,

    /// Maximum messages pulled per queue receive.
    pub batch_size: usize,

    /// How long a queue receive may block.
    pub poll_timeout: Duration,

    /// Upper bound on a single plugin invocation.
    pub plugin_timeout: Duration,

    /// How often the plugin config document is reloaded.
    pub config_refresh_interval: Duration,

    /// Attempts for a property filter upsert before dead-lettering.
    pub persist_max_attempts: u32,

    /// Linear backoff step between upsert attempts.
    pub persist_retry_delay: Duration,

    /// Delay before the worker pool is restarted after a crash.
    pub restart_delay: Duration,

    /// Bind address for the health and metrics server.
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_hosts: vec![PathBuf::from("./spool")],
            consumer_topic: "events_plugin_ingestion".to_string(),
            producer_topic: "events_processed".to_string(),
            dead_letter_topic: "events_dead_letter".to_string(),
            plugin_config_path: PathBuf::from("./plugins.json"),
            database_path: PathBuf::from("./data/propfilter.db"),
            worker_count: 4,
            batch_size: 100,
            poll_timeout: Duration::from_millis(1000),
            plugin_timeout: Duration::from_millis(5000),
            config_refresh_interval: Duration::from_secs(30),
            persist_max_attempts: 5,
            persist_retry_delay: Duration::from_millis(100),
            restart_delay: Duration::from_secs(1),
            bind_addr: "0.0.0.0:3301".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `QUEUE_HOSTS`: comma-separated spool roots (default: "./spool")
    /// - `CONSUMER_TOPIC` (default: "events_plugin_ingestion")
    /// - `PRODUCER_TOPIC` (default: "events_processed")
    /// - `DEAD_LETTER_TOPIC` (default: "events_dead_letter")
    /// - `PLUGIN_CONFIG_PATH` (default: "./plugins.json")
    /// - `DATABASE_PATH` (default: "./data/propfilter.db")
    /// - `WORKER_COUNT` (default: 4), `BATCH_SIZE` (default: 100)
    /// - `POLL_TIMEOUT_MS` (default: 1000), `PLUGIN_TIMEOUT_MS` (default: 5000)
    /// - `CONFIG_REFRESH_SECS` (default: 30)
    /// - `PERSIST_MAX_ATTEMPTS` (default: 5), `PERSIST_RETRY_DELAY_MS` (default: 100)
    /// - `RESTART_DELAY_SECS` (default: 1)
    /// - `BIND_ADDR` (default: "0.0.0.0:3301")
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let queue_hosts: Vec<PathBuf> = match std::env::var("QUEUE_HOSTS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
            Err(_) => defaults.queue_hosts,
        };
        if queue_hosts.is_empty() {
            return Err(Error::Config("QUEUE_HOSTS lists no hosts".to_string()));
        }

        let config = Self {
            queue_hosts,
            consumer_topic: env_string("CONSUMER_TOPIC", defaults.consumer_topic),
            producer_topic: env_string("PRODUCER_TOPIC", defaults.producer_topic),
            dead_letter_topic: env_string("DEAD_LETTER_TOPIC", defaults.dead_letter_topic),
            plugin_config_path: std::env::var("PLUGIN_CONFIG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_config_path),
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            worker_count: env_parse("WORKER_COUNT", defaults.worker_count)?,
            batch_size: env_parse("BATCH_SIZE", defaults.batch_size)?,
            poll_timeout: Duration::from_millis(env_parse("POLL_TIMEOUT_MS", 1000)?),
            plugin_timeout: Duration::from_millis(env_parse("PLUGIN_TIMEOUT_MS", 5000)?),
            config_refresh_interval: Duration::from_secs(env_parse("CONFIG_REFRESH_SECS", 30)?),
            persist_max_attempts: env_parse("PERSIST_MAX_ATTEMPTS", defaults.persist_max_attempts)?,
            persist_retry_delay: Duration::from_millis(env_parse("PERSIST_RETRY_DELAY_MS", 100)?),
            restart_delay: Duration::from_secs(env_parse("RESTART_DELAY_SECS", 1)?),
            bind_addr: env_string("BIND_ADDR", defaults.bind_addr),
        };

        if config.worker_count == 0 {
            return Err(Error::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if config.batch_size == 0 {
            return Err(Error::Config("BATCH_SIZE must be at least 1".to_string()));
        }
        if config.config_refresh_interval.is_zero() {
            return Err(Error::Config(
                "CONFIG_REFRESH_SECS must be at least 1".to_string(),
            ));
        }
        if config.plugin_timeout.is_zero() {
            return Err(Error::Config(
                "PLUGIN_TIMEOUT_MS must be at least 1".to_string(),
            ));
        }
        if config.persist_max_attempts == 0 {
            return Err(Error::Config(
                "PERSIST_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        tracing::info!(
            queue_hosts = config.queue_hosts.len(),
            consumer_topic = %config.consumer_topic,
            producer_topic = %config.producer_topic,
            dead_letter_topic = %config.dead_letter_topic,
            workers = config.worker_count,
            "plugin server configuration loaded"
        );

        Ok(config)
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}='{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "QUEUE_HOSTS",
        "CONSUMER_TOPIC",
        "PRODUCER_TOPIC",
        "DEAD_LETTER_TOPIC",
        "PLUGIN_CONFIG_PATH",
        "DATABASE_PATH",
        "WORKER_COUNT",
        "BATCH_SIZE",
        "POLL_TIMEOUT_MS",
        "PLUGIN_TIMEOUT_MS",
        "CONFIG_REFRESH_SECS",
        "PERSIST_MAX_ATTEMPTS",
        "PERSIST_RETRY_DELAY_MS",
        "RESTART_DELAY_SECS",
        "BIND_ADDR",
    ];

    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: serialized by ENV_MUTEX; only these tests touch these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        // SAFETY: restoring the original env state under the same lock.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.queue_hosts, vec![PathBuf::from("./spool")]);
            assert_eq!(config.consumer_topic, "events_plugin_ingestion");
            assert_eq!(config.worker_count, 4);
            assert_eq!(config.plugin_timeout, Duration::from_secs(5));
            assert_eq!(config.persist_max_attempts, 5);
            assert_eq!(config.restart_delay, Duration::from_secs(1));
        });
    }

    #[test]
    fn config_custom_values() {
        with_env_vars(
            &[
                ("QUEUE_HOSTS", "/spool/a, /spool/b,"),
                ("CONSUMER_TOPIC", "ingest"),
                ("DEAD_LETTER_TOPIC", "dlq"),
                ("WORKER_COUNT", "8"),
                ("PLUGIN_TIMEOUT_MS", "250"),
                ("BIND_ADDR", "127.0.0.1:9000"),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(
                    config.queue_hosts,
                    vec![PathBuf::from("/spool/a"), PathBuf::from("/spool/b")]
                );
                assert_eq!(config.consumer_topic, "ingest");
                assert_eq!(config.dead_letter_topic, "dlq");
                assert_eq!(config.worker_count, 8);
                assert_eq!(config.plugin_timeout, Duration::from_millis(250));
                assert_eq!(config.bind_addr, "127.0.0.1:9000");
            },
        );
    }

    #[test]
    fn config_rejects_bad_numbers() {
        with_env_vars(&[("BATCH_SIZE", "lots")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("BATCH_SIZE"));
        });
        with_env_vars(&[("WORKER_COUNT", "0")], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn config_rejects_zero_durations() {
        with_env_vars(&[("CONFIG_REFRESH_SECS", "0")], || {
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(err.to_string().contains("CONFIG_REFRESH_SECS"));
        });
        with_env_vars(&[("PLUGIN_TIMEOUT_MS", "0")], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("PLUGIN_TIMEOUT_MS"));
        });
        with_env_vars(&[("CONFIG_REFRESH_SECS", "1")], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.config_refresh_interval, Duration::from_secs(1));
        });
    }

    #[test]
    fn config_rejects_empty_host_list() {
        with_env_vars(&[("QUEUE_HOSTS", " , ")], || {
            assert!(matches!(Config::from_env(), Err(Error::Config(_))));
        });
    }
}
