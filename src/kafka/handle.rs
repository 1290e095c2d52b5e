//! Close-safe wrapper around a raw driver session.
//!
//! A [`ProducerHandle`] owns exactly one driver and knows who owns *it*:
//! detached handles close physically, factory-retained handles ignore
//! `close()` (the factory closes them on teardown or explicit release), and
//! pooled transactional handles hand the decision to the pool's release
//! protocol. Transactional verbs record failures so release can distinguish
//! a reusable session from one that must be evicted.

use crate::kafka::driver::{DeliveryCallback, ProducerDriver};
use crate::kafka::error::TxFailure;
use crate::kafka::pool::{ReleaseOutcome, TransactionalPool};
use crate::kafka::record::{SinkRecord, TopicPartitionOffset};
use log::{debug, error, trace};
use rdkafka::error::KafkaError;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub(crate) enum Ownership {
    /// Ad hoc handle; `close()` physically closes the driver
    Detached,
    /// Factory-retained (shared singleton or thread-bound); `close()` is a no-op
    Retained,
    /// Transactional handle owned by a pool
    Pooled {
        pool: Weak<TransactionalPool>,
        prefix: String,
        /// Present for partition-dedicated handles, which are retained by
        /// the dedicated map rather than the FIFO queue
        partition_key: Option<String>,
    },
}

pub struct ProducerHandle {
    driver: Arc<dyn ProducerDriver>,
    transaction_id: Option<String>,
    ownership: Ownership,
    tx_failure: Mutex<Option<TxFailure>>,
    /// Serializes the enqueue-or-close decision on release
    release_lock: Mutex<()>,
    self_ref: Weak<ProducerHandle>,
}

impl ProducerHandle {
    pub(crate) fn detached(driver: Arc<dyn ProducerDriver>) -> Arc<Self> {
        Self::build(driver, None, Ownership::Detached)
    }

    pub(crate) fn retained(driver: Arc<dyn ProducerDriver>) -> Arc<Self> {
        Self::build(driver, None, Ownership::Retained)
    }

    pub(crate) fn pooled(
        driver: Arc<dyn ProducerDriver>,
        transaction_id: String,
        pool: &Arc<TransactionalPool>,
        prefix: String,
        partition_key: Option<String>,
    ) -> Arc<Self> {
        Self::build(
            driver,
            Some(transaction_id),
            Ownership::Pooled {
                pool: Arc::downgrade(pool),
                prefix,
                partition_key,
            },
        )
    }

    fn build(
        driver: Arc<dyn ProducerDriver>,
        transaction_id: Option<String>,
        ownership: Ownership,
    ) -> Arc<Self> {
        let handle = Arc::new_cyclic(|self_ref| ProducerHandle {
            driver,
            transaction_id,
            ownership,
            tx_failure: Mutex::new(None),
            release_lock: Mutex::new(()),
            self_ref: self_ref.clone(),
        });
        debug!("created producer handle {}", handle.describe());
        handle
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Enqueue a record; `on_delivery` fires on the driver's completion thread
    pub fn send(
        &self,
        record: SinkRecord,
        on_delivery: DeliveryCallback,
    ) -> Result<(), (KafkaError, SinkRecord)> {
        trace!("{} send to topic '{}'", self.describe(), record.topic);
        self.driver.send(record, on_delivery)
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        trace!("{} flush()", self.describe());
        self.driver.flush(timeout)
    }

    pub fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>, KafkaError> {
        self.driver.partitions_for(topic, timeout)
    }

    pub fn begin_transaction(&self) -> Result<(), KafkaError> {
        debug!("{} begin_transaction()", self.describe());
        self.driver.begin_transaction().map_err(|e| {
            error!("begin_transaction failed on {}: {}", self.describe(), e);
            self.record_failure(e.clone());
            e
        })
    }

    pub fn commit_transaction(&self, timeout: Duration) -> Result<(), KafkaError> {
        debug!("{} commit_transaction()", self.describe());
        self.driver.commit_transaction(timeout).map_err(|e| {
            error!("commit_transaction failed on {}: {}", self.describe(), e);
            self.record_failure(e.clone());
            e
        })
    }

    /// Abort the current transaction.
    ///
    /// A no-op when a begin/commit already failed: the driver session is
    /// assumed unusable and a second transactional operation on it is
    /// unsafe.
    pub fn abort_transaction(&self, timeout: Duration) -> Result<(), KafkaError> {
        if let Some(failure) = self.tx_failure() {
            debug!(
                "abort_transaction ignored on {} - previous transactional failure: {}",
                self.describe(),
                failure.error
            );
            return Ok(());
        }
        debug!("{} abort_transaction()", self.describe());
        self.driver.abort_transaction(timeout).map_err(|e| {
            error!("abort_transaction failed on {}: {}", self.describe(), e);
            self.record_failure(e.clone());
            e
        })
    }

    pub fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartitionOffset],
        group_id: &str,
        timeout: Duration,
    ) -> Result<(), KafkaError> {
        trace!(
            "{} send_offsets_to_transaction(group '{}')",
            self.describe(),
            group_id
        );
        self.driver
            .send_offsets_to_transaction(offsets, group_id, timeout)
    }

    /// Release this handle.
    ///
    /// Detached handles close the driver physically; factory-retained
    /// handles stay open (their lifetime belongs to the factory); pooled
    /// handles are offered back to their pool, which decides between reuse
    /// and eviction based on the recorded transactional health.
    pub fn close(&self, timeout: Duration) {
        match &self.ownership {
            Ownership::Detached => {
                trace!("{} close: physical", self.describe());
                self.driver.close(timeout);
            }
            Ownership::Retained => {
                trace!("{} close ignored: factory-retained", self.describe());
            }
            Ownership::Pooled { pool, .. } => match (pool.upgrade(), self.self_ref.upgrade()) {
                (Some(pool), Some(this)) => match pool.release(&this, timeout) {
                    ReleaseOutcome::Reused => trace!("{} returned to pool", self.describe()),
                    ReleaseOutcome::Evicted => debug!("{} evicted from pool", self.describe()),
                },
                _ => {
                    // pool already torn down; nothing left to return to
                    self.driver.close(timeout);
                }
            },
        }
    }

    pub fn is_tx_failed(&self) -> bool {
        self.tx_failure.lock().unwrap().is_some()
    }

    pub(crate) fn tx_failure(&self) -> Option<TxFailure> {
        self.tx_failure.lock().unwrap().clone()
    }

    pub(crate) fn driver(&self) -> &Arc<dyn ProducerDriver> {
        &self.driver
    }

    pub(crate) fn partition_key(&self) -> Option<&str> {
        match &self.ownership {
            Ownership::Pooled { partition_key, .. } => partition_key.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn pooled_prefix(&self) -> Option<&str> {
        match &self.ownership {
            Ownership::Pooled { prefix, .. } => Some(prefix.as_str()),
            _ => None,
        }
    }

    pub(crate) fn release_guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.release_lock.lock().unwrap()
    }

    fn record_failure(&self, error: KafkaError) {
        *self.tx_failure.lock().unwrap() = Some(TxFailure::new(error));
    }

    fn describe(&self) -> String {
        match &self.transaction_id {
            Some(tx_id) => format!("producer[txId={}]", tx_id),
            None => "producer".to_string(),
        }
    }
}

impl std::fmt::Debug for ProducerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerHandle")
            .field("transaction_id", &self.transaction_id)
            .field("tx_failed", &self.is_tx_failed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::testing::{errors, MockDriver};

    #[test]
    fn test_begin_failure_is_recorded() {
        let driver = MockDriver::manual();
        driver.fail_next_begin(errors::generic());
        let handle = ProducerHandle::detached(driver.clone());

        assert!(handle.begin_transaction().is_err());
        assert!(handle.is_tx_failed());
    }

    #[test]
    fn test_abort_is_noop_after_recorded_failure() {
        let driver = MockDriver::manual();
        driver.fail_next_commit(errors::generic());
        let handle = ProducerHandle::detached(driver.clone());

        assert!(handle.commit_transaction(Duration::from_secs(1)).is_err());
        // abort must not reach the driver once the session is marked failed
        assert!(handle.abort_transaction(Duration::from_secs(1)).is_ok());
        assert_eq!(driver.abort_count(), 0);
    }

    #[test]
    fn test_abort_delegates_when_healthy() {
        let driver = MockDriver::manual();
        let handle = ProducerHandle::detached(driver.clone());

        assert!(handle.abort_transaction(Duration::from_secs(1)).is_ok());
        assert_eq!(driver.abort_count(), 1);
    }

    #[test]
    fn test_detached_close_is_physical() {
        let driver = MockDriver::manual();
        let handle = ProducerHandle::detached(driver.clone());

        handle.close(Duration::from_secs(5));
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_retained_close_is_ignored() {
        let driver = MockDriver::manual();
        let handle = ProducerHandle::retained(driver.clone());

        handle.close(Duration::from_secs(5));
        assert_eq!(driver.close_count(), 0);
    }
}
