//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Configuration for a workflow engine process
///
/// All durations are serialized as milliseconds, matching the recognized
/// configuration keys (`leaseTtlMs`, `heartbeatIntervalMs`, ...).
///
/// # Example
///
/// ```
/// use strand_engine::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_lease_ttl(Duration::from_secs(60))
///     .with_global_inflight_cap(256);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Unique identifier for this engine process (lease owner id)
    pub engine_id: String,

    /// Lease lifetime
    #[serde(with = "duration_millis")]
    pub lease_ttl: Duration,

    /// Lease renewal cadence
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Heartbeat age after which maintenance declares an instance orphaned
    #[serde(with = "duration_millis")]
    pub stale_threshold: Duration,

    /// Max concurrent executor calls across all instances
    pub global_inflight_cap: usize,

    /// Per-instance concurrency default unless the instance or node overrides
    pub default_max_concurrency: usize,

    /// Cooperative cancellation grace window
    #[serde(with = "duration_millis")]
    pub cancel_grace: Duration,

    /// Event-row retention
    #[serde(with = "duration_millis")]
    pub retention: Duration,

    /// Maintenance sweep interval
    #[serde(with = "duration_millis")]
    pub maintenance_interval: Duration,

    /// Bounded retry for store mutations before the engine yields its lease
    pub storage_retry_attempts: u32,

    /// Base delay for store mutation retries (exponential backoff)
    #[serde(with = "duration_millis")]
    pub storage_retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: format!("engine-{}", Uuid::now_v7()),
            lease_ttl: Duration::from_secs(120),
            heartbeat_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            global_inflight_cap: 128,
            default_max_concurrency: 8,
            cancel_grace: Duration::from_secs(10),
            retention: Duration::from_secs(7 * 24 * 3600),
            maintenance_interval: Duration::from_secs(60),
            storage_retry_attempts: 5,
            storage_retry_base_delay: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Set the engine id
    pub fn with_engine_id(mut self, id: impl Into<String>) -> Self {
        self.engine_id = id.into();
        self
    }

    /// Set the lease lifetime
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the stale threshold
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Set the global in-flight executor cap
    pub fn with_global_inflight_cap(mut self, cap: usize) -> Self {
        self.global_inflight_cap = cap.max(1);
        self
    }

    /// Set the per-instance concurrency default
    pub fn with_default_max_concurrency(mut self, max: usize) -> Self {
        self.default_max_concurrency = max.max(1);
        self
    }

    /// Set the cancellation grace window
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    /// Set the event retention window
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the maintenance sweep interval
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.lease_ttl, Duration::from_secs(120));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.stale_threshold, Duration::from_secs(300));
        assert_eq!(config.cancel_grace, Duration::from_secs(10));
        assert!(config.engine_id.starts_with("engine-"));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_engine_id("engine-a")
            .with_lease_ttl(Duration::from_secs(10))
            .with_global_inflight_cap(0);

        assert_eq!(config.engine_id, "engine-a");
        assert_eq!(config.lease_ttl, Duration::from_secs(10));
        // Cap is clamped to at least 1
        assert_eq!(config.global_inflight_cap, 1);
    }

    #[test]
    fn test_serialization_uses_millis() {
        let config = EngineConfig::default().with_lease_ttl(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lease_ttl"], serde_json::json!(1500));
    }
}
