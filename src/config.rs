//! Bus configuration.
//!
//! [`BusConfig`] has sensible defaults for every field and can be adjusted
//! with the `with_*` builders or loaded from the environment with
//! [`BusConfig::from_env`].

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Service name used when `SERVICE_NAME` is not set.
pub const DEFAULT_SERVICE_NAME: &str = "letterbox";
/// Reserved topic holding outbox envelopes.
pub const DEFAULT_FORWARDER_TOPIC: &str = "_forwarder_queue";
/// Consumer group used by the forwarder, isolated from application groups.
pub const DEFAULT_FORWARDER_GROUP: &str = "forwarder-consumer";
/// Capacity of the error channel returned by `subscribe`.
pub const DEFAULT_ERROR_CHANNEL_CAPACITY: usize = 100;

/// Settings for a [`Bus`](crate::Bus).
///
/// Every field has a default. The environment keys read by
/// [`from_env`](Self::from_env) are listed in the crate docs.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Connection string for the relational backend.
    pub database_url: String,
    /// Maximum number of pooled connections.
    pub max_connections: u32,
    /// Group used by `Bus::subscribe`. `None` means broadcast.
    pub consumer_group: Option<String>,
    /// Route every publish through the outbox forwarder.
    pub forwarder_enabled: bool,
    pub forwarder_topic: String,
    pub forwarder_group: String,
    /// Wait between polls when a topic has nothing to claim.
    pub poll_interval: Duration,
    /// Maximum number of messages claimed per poll.
    pub batch_size: usize,
    /// How long a claim stays exclusive before another consumer may take it.
    pub claim_lease: Duration,
    /// How long a nacked message stays invisible before redelivery.
    pub redelivery_delay: Duration,
    pub retry: RetryPolicy,
    /// Upper bound on waiting for in-flight handlers during shutdown.
    pub shutdown_timeout: Duration,
    pub error_channel_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/letterbox".to_owned(),
            max_connections: 10,
            consumer_group: Some(consumer_group_for(DEFAULT_SERVICE_NAME)),
            forwarder_enabled: false,
            forwarder_topic: DEFAULT_FORWARDER_TOPIC.to_owned(),
            forwarder_group: DEFAULT_FORWARDER_GROUP.to_owned(),
            poll_interval: Duration::from_secs(1),
            batch_size: 10,
            claim_lease: Duration::from_secs(30),
            redelivery_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            error_channel_capacity: DEFAULT_ERROR_CHANNEL_CAPACITY,
        }
    }
}

impl BusConfig {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    ///
    /// Unset keys keep their default; set but unparsable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("LETTERBOX_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            config.database_url = url;
        }
        if let Some(service) = lookup("SERVICE_NAME") {
            config.consumer_group = Some(consumer_group_for(&service));
        }
        if let Some(topic) = lookup("LETTERBOX_FORWARDER_TOPIC") {
            config.forwarder_topic = topic;
        }
        if let Some(group) = lookup("LETTERBOX_FORWARDER_GROUP") {
            config.forwarder_group = group;
        }
        if let Some(enabled) = parse(&lookup, "LETTERBOX_FORWARDER")? {
            config.forwarder_enabled = enabled;
        }
        if let Some(max) = parse(&lookup, "LETTERBOX_MAX_CONNECTIONS")? {
            config.max_connections = max;
        }
        if let Some(ms) = parse(&lookup, "LETTERBOX_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse(&lookup, "LETTERBOX_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(secs) = parse(&lookup, "LETTERBOX_CLAIM_LEASE_SECS")? {
            config.claim_lease = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "LETTERBOX_REDELIVERY_DELAY_MS")? {
            config.redelivery_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse(&lookup, "LETTERBOX_MAX_ATTEMPTS")? {
            config.retry = config.retry.with_max_attempts(attempts);
        }
        if let Some(ms) = parse(&lookup, "LETTERBOX_RETRY_BASE_DELAY_MS")? {
            config.retry = config.retry.with_base_delay(Duration::from_millis(ms));
        }
        if let Some(secs) = parse(&lookup, "LETTERBOX_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Set the default consumer group used by `subscribe`.
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    /// Make `subscribe` broadcast to every subscriber by default.
    pub fn with_broadcast(mut self) -> Self {
        self.consumer_group = None;
        self
    }

    /// Route publishes through the outbox forwarder.
    pub fn with_forwarder(mut self) -> Self {
        self.forwarder_enabled = true;
        self
    }

    pub fn with_forwarder_topic(mut self, topic: impl Into<String>) -> Self {
        self.forwarder_topic = topic.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_error_channel_capacity(mut self, capacity: usize) -> Self {
        self.error_channel_capacity = capacity.max(1);
        self
    }
}

fn consumer_group_for(service: &str) -> String {
    format!("{service}-consumer")
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map(Some).map_err(|e| ConfigError {
        key,
        reason: e.to_string(),
        value,
    })
}

/// Error returned when an environment variable holds an invalid value.
#[derive(Debug)]
pub struct ConfigError {
    key: &'static str,
    value: String,
    reason: String,
}

impl ConfigError {
    pub fn key(&self) -> &str {
        self.key
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid value {:?} for {}: {}",
            self.value, self.key, self.reason
        )
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BusConfig::default();

        assert_eq!(config.consumer_group.as_deref(), Some("letterbox-consumer"));
        assert_eq!(config.forwarder_topic, "_forwarder_queue");
        assert_eq!(config.forwarder_group, "forwarder-consumer");
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.retry.base_delay(), Duration::from_secs(1));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.error_channel_capacity, 100);
        assert!(!config.forwarder_enabled);
    }

    #[test]
    fn service_name_derives_consumer_group() {
        let config = BusConfig::from_lookup(lookup(&[("SERVICE_NAME", "items")])).unwrap();
        assert_eq!(config.consumer_group.as_deref(), Some("items-consumer"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = BusConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/app"),
            ("LETTERBOX_FORWARDER", "true"),
            ("LETTERBOX_POLL_INTERVAL_MS", "250"),
            ("LETTERBOX_MAX_ATTEMPTS", "5"),
            ("LETTERBOX_SHUTDOWN_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.database_url, "postgres://db/app");
        assert!(config.forwarder_enabled);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn letterbox_database_url_wins_over_database_url() {
        let config = BusConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://generic"),
            ("LETTERBOX_DATABASE_URL", "postgres://specific"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "postgres://specific");
    }

    #[test]
    fn invalid_value_reports_key() {
        let err = BusConfig::from_lookup(lookup(&[("LETTERBOX_BATCH_SIZE", "many")])).unwrap_err();
        assert_eq!(err.key(), "LETTERBOX_BATCH_SIZE");
        assert!(err.to_string().contains("\"many\""));
    }
}
