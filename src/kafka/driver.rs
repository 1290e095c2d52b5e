//! Driver seam between the pooling/transaction layer and the raw client.
//!
//! Everything above this trait is broker-agnostic: the factory, pool and
//! sink only ever talk to a `ProducerDriver`, so the whole lifecycle layer
//! can be exercised against the in-memory driver in [`crate::kafka::testing`]
//! while production wires in [`crate::kafka::rdkafka_driver::RdKafkaDriver`].

use crate::kafka::error::SinkError;
use crate::kafka::record::{RecordMetadata, SinkRecord, TopicPartitionOffset};
use rdkafka::error::KafkaError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Invoked exactly once on the driver's completion thread when the broker
/// acknowledges (or rejects) a record.
pub type DeliveryCallback = Box<dyn FnOnce(Result<RecordMetadata, KafkaError>) + Send + Sync>;

/// A raw producer session. One instance maps to one client connection with
/// its own `client.id` and (optionally) `transactional.id`.
///
/// Implementations must be safe to share across threads; `close` must be
/// idempotent because teardown and wrapper eviction may race.
pub trait ProducerDriver: Send + Sync {
    /// Enqueue a record; non-blocking. `on_delivery` fires later, on the
    /// driver's own completion thread. A synchronous rejection returns the
    /// record so the caller keeps ownership of it.
    fn send(
        &self,
        record: SinkRecord,
        on_delivery: DeliveryCallback,
    ) -> Result<(), (KafkaError, SinkRecord)>;

    /// Block until all queued records are acknowledged or `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<(), KafkaError>;

    /// Partition ids currently known for `topic`.
    fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>, KafkaError>;

    fn init_transactions(&self, timeout: Duration) -> Result<(), KafkaError>;

    fn begin_transaction(&self) -> Result<(), KafkaError>;

    fn commit_transaction(&self, timeout: Duration) -> Result<(), KafkaError>;

    fn abort_transaction(&self, timeout: Duration) -> Result<(), KafkaError>;

    fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartitionOffset],
        group_id: &str,
        timeout: Duration,
    ) -> Result<(), KafkaError>;

    /// Physically close the session, waiting up to `timeout` for in-flight
    /// records. Never fails; problems are logged.
    fn close(&self, timeout: Duration);
}

/// Immutable driver option name/value map captured at factory construction.
///
/// Per-handle copies are derived from it with `transactional.id` or a
/// generated `client.id` appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverConfig {
    options: BTreeMap<String, String>,
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    /// Insert an option, consuming and returning self for chaining
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|v| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.options.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Constructs raw driver sessions for the handle factory.
pub trait DriverFactory: Send + Sync {
    fn create(&self, config: &DriverConfig) -> Result<Arc<dyn ProducerDriver>, SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_config_set_and_get() {
        let config = DriverConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .set("acks", "all");

        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(config.get("acks"), Some("all"));
        assert!(!config.contains("transactional.id"));
    }

    #[test]
    fn test_driver_config_derived_copy() {
        let base = DriverConfig::new().set("bootstrap.servers", "localhost:9092");
        let mut derived = base.clone();
        derived.insert("transactional.id", "tx-0");

        assert!(!base.contains("transactional.id"));
        assert_eq!(derived.get("transactional.id"), Some("tx-0"));
        assert_eq!(derived.get("bootstrap.servers"), Some("localhost:9092"));
    }
}
