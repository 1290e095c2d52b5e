//! Reuse cache for transactional handles.
//!
//! Two structures, both owned by the factory: a FIFO queue of idle handles
//! per transaction-id prefix, and a map of partition-dedicated handles keyed
//! by consumer-partition suffix. The dedicated map exists to avoid the
//! zombie-producer hazard: a stalled handle that resumes after a replacement
//! was built for the same partition group would duplicate deliveries, so
//! each suffix gets exactly one live handle.

use crate::kafka::error::{SinkError, TxFailureKind};
use crate::kafka::handle::ProducerHandle;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Decision returned by the release protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The handle stays alive for reuse (queued, or retained by the
    /// dedicated map)
    Reused,
    /// The handle was physically closed and removed from any map
    Evicted,
}

pub struct TransactionalPool {
    /// Idle handles per transaction-id prefix, FIFO
    queues: Mutex<HashMap<String, VecDeque<Arc<ProducerHandle>>>>,
    /// At most one live handle per consumer-partition suffix
    dedicated: Mutex<HashMap<String, Arc<ProducerHandle>>>,
    capacity: Option<usize>,
}

impl TransactionalPool {
    pub(crate) fn new(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(TransactionalPool {
            queues: Mutex::new(HashMap::new()),
            dedicated: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    /// Pop an idle handle for `prefix`, if any.
    pub(crate) fn checkout(&self, prefix: &str) -> Option<Arc<ProducerHandle>> {
        self.queues
            .lock()
            .unwrap()
            .get_mut(prefix)
            .and_then(|queue| queue.pop_front())
    }

    /// Look up the dedicated handle for `suffix`, creating it under the map
    /// lock if absent so two racing callers can never build two live
    /// handles for the same partition group.
    pub(crate) fn dedicated_or_create(
        &self,
        suffix: &str,
        create: impl FnOnce() -> Result<Arc<ProducerHandle>, SinkError>,
    ) -> Result<Arc<ProducerHandle>, SinkError> {
        let mut dedicated = self.dedicated.lock().unwrap();
        if let Some(handle) = dedicated.get(suffix) {
            return Ok(handle.clone());
        }
        let handle = create()?;
        dedicated.insert(suffix.to_string(), handle.clone());
        Ok(handle)
    }

    /// Remove and return the dedicated handle for `suffix`, if present.
    pub(crate) fn take_dedicated(&self, suffix: &str) -> Option<Arc<ProducerHandle>> {
        self.dedicated.lock().unwrap().remove(suffix)
    }

    /// Decide the fate of a released handle.
    ///
    /// A recorded transactional failure evicts: the driver is physically
    /// closed (with a near-zero timeout when the failure itself was a
    /// timeout, to avoid hanging on an unresponsive broker) and any
    /// dedicated-map entry is dropped. A healthy partition-dedicated handle
    /// stays owned by the map. A healthy shared handle is queued unless it
    /// is already idle in the queue or the capacity bound is reached.
    pub(crate) fn release(
        &self,
        handle: &Arc<ProducerHandle>,
        timeout: Duration,
    ) -> ReleaseOutcome {
        if let Some(failure) = handle.tx_failure() {
            let close_timeout = if failure.kind == TxFailureKind::Timeout {
                Duration::ZERO
            } else {
                timeout
            };
            warn!(
                "transactional failure on producer '{}'; removing from pool; possible cause: broker restarted during transaction ({})",
                handle.transaction_id().unwrap_or("?"),
                failure.error
            );
            handle.driver().close(close_timeout);
            if handle.partition_key().is_some() {
                self.remove_dedicated(handle);
            }
            return ReleaseOutcome::Evicted;
        }

        if handle.partition_key().is_some() {
            // dedicated handles are retained by the map, never queued
            return ReleaseOutcome::Reused;
        }

        let prefix = match handle.pooled_prefix() {
            Some(prefix) => prefix.to_string(),
            None => {
                handle.driver().close(timeout);
                return ReleaseOutcome::Evicted;
            }
        };

        // per-handle lock so two concurrent closes cannot double-insert
        let _guard = handle.release_guard();
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.entry(prefix).or_default();
        if queue.iter().any(|idle| Arc::ptr_eq(idle, handle)) {
            return ReleaseOutcome::Reused;
        }
        if let Some(capacity) = self.capacity {
            if queue.len() >= capacity {
                drop(queues);
                debug!(
                    "pool full; closing producer '{}'",
                    handle.transaction_id().unwrap_or("?")
                );
                handle.driver().close(timeout);
                return ReleaseOutcome::Evicted;
            }
        }
        queue.push_back(handle.clone());
        ReleaseOutcome::Reused
    }

    fn remove_dedicated(&self, handle: &Arc<ProducerHandle>) {
        let mut dedicated = self.dedicated.lock().unwrap();
        dedicated.retain(|_, entry| !Arc::ptr_eq(entry, handle));
    }

    /// Physically close everything: drain every prefix queue, then the
    /// dedicated map. Close problems are logged by the drivers and never
    /// abort the drain.
    pub(crate) fn drain(&self, timeout: Duration) {
        let mut queues = self.queues.lock().unwrap();
        for (prefix, queue) in queues.iter_mut() {
            while let Some(handle) = queue.pop_front() {
                debug!("closing pooled producer for prefix '{}'", prefix);
                handle.driver().close(timeout);
            }
        }
        queues.clear();
        drop(queues);

        let mut dedicated = self.dedicated.lock().unwrap();
        for (suffix, handle) in dedicated.iter() {
            debug!("closing partition-dedicated producer for suffix '{}'", suffix);
            handle.driver().close(timeout);
        }
        dedicated.clear();
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, prefix: &str) -> usize {
        self.queues
            .lock()
            .unwrap()
            .get(prefix)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::testing::{errors, MockDriver};

    fn pooled_handle(
        pool: &Arc<TransactionalPool>,
        driver: &Arc<MockDriver>,
        partition_key: Option<&str>,
    ) -> Arc<ProducerHandle> {
        ProducerHandle::pooled(
            driver.clone(),
            "tx-0".to_string(),
            pool,
            "tx-".to_string(),
            partition_key.map(|k| k.to_string()),
        )
    }

    #[test]
    fn test_release_healthy_queues_for_reuse() {
        let pool = TransactionalPool::new(None);
        let driver = MockDriver::manual();
        let handle = pooled_handle(&pool, &driver, None);

        assert_eq!(
            pool.release(&handle, Duration::from_secs(5)),
            ReleaseOutcome::Reused
        );
        assert_eq!(pool.idle_count("tx-"), 1);
        assert_eq!(driver.close_count(), 0);
        assert!(Arc::ptr_eq(&pool.checkout("tx-").unwrap(), &handle));
    }

    #[test]
    fn test_release_never_double_inserts() {
        let pool = TransactionalPool::new(None);
        let driver = MockDriver::manual();
        let handle = pooled_handle(&pool, &driver, None);

        pool.release(&handle, Duration::from_secs(5));
        assert_eq!(
            pool.release(&handle, Duration::from_secs(5)),
            ReleaseOutcome::Reused
        );
        assert_eq!(pool.idle_count("tx-"), 1);
    }

    #[test]
    fn test_release_failed_evicts_and_closes() {
        let pool = TransactionalPool::new(None);
        let driver = MockDriver::manual();
        driver.fail_next_commit(errors::generic());
        let handle = pooled_handle(&pool, &driver, None);
        let _ = handle.commit_transaction(Duration::from_secs(1));

        assert_eq!(
            pool.release(&handle, Duration::from_secs(5)),
            ReleaseOutcome::Evicted
        );
        assert_eq!(pool.idle_count("tx-"), 0);
        assert_eq!(driver.close_count(), 1);
        assert_eq!(driver.close_timeouts(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn test_timeout_failure_closes_with_zero_timeout() {
        let pool = TransactionalPool::new(None);
        let driver = MockDriver::manual();
        driver.fail_next_commit(errors::timeout());
        let handle = pooled_handle(&pool, &driver, None);
        let _ = handle.commit_transaction(Duration::from_secs(1));

        pool.release(&handle, Duration::from_secs(30));
        assert_eq!(driver.close_timeouts(), vec![Duration::ZERO]);
    }

    #[test]
    fn test_healthy_dedicated_handle_stays_in_map() {
        let pool = TransactionalPool::new(None);
        let driver = MockDriver::manual();
        let handle = pool
            .dedicated_or_create("0", || Ok(pooled_handle(&pool, &driver, Some("0"))))
            .unwrap();

        assert_eq!(
            pool.release(&handle, Duration::from_secs(5)),
            ReleaseOutcome::Reused
        );
        // not queued; still resolvable through the dedicated map
        assert_eq!(pool.idle_count("tx-"), 0);
        let again = pool
            .dedicated_or_create("0", || panic!("must not create a second handle"))
            .unwrap();
        assert!(Arc::ptr_eq(&again, &handle));
    }

    #[test]
    fn test_failed_dedicated_handle_is_removed_from_map() {
        let pool = TransactionalPool::new(None);
        let driver = MockDriver::manual();
        driver.fail_next_begin(errors::generic());
        let handle = pool
            .dedicated_or_create("0", || Ok(pooled_handle(&pool, &driver, Some("0"))))
            .unwrap();
        let _ = handle.begin_transaction();

        assert_eq!(
            pool.release(&handle, Duration::from_secs(5)),
            ReleaseOutcome::Evicted
        );
        assert!(pool.take_dedicated("0").is_none());
        assert_eq!(driver.close_count(), 1);
    }

    #[test]
    fn test_capacity_bound_closes_overflow() {
        let pool = TransactionalPool::new(Some(1));
        let first = MockDriver::manual();
        let second = MockDriver::manual();
        let kept = pooled_handle(&pool, &first, None);
        let overflow = pooled_handle(&pool, &second, None);

        assert_eq!(
            pool.release(&kept, Duration::from_secs(5)),
            ReleaseOutcome::Reused
        );
        assert_eq!(
            pool.release(&overflow, Duration::from_secs(5)),
            ReleaseOutcome::Evicted
        );
        assert_eq!(second.close_count(), 1);
        assert_eq!(pool.idle_count("tx-"), 1);
    }

    #[test]
    fn test_drain_closes_everything_once() {
        let pool = TransactionalPool::new(None);
        let queued = MockDriver::manual();
        let dedicated = MockDriver::manual();
        let handle = pooled_handle(&pool, &queued, None);
        pool.release(&handle, Duration::from_secs(5));
        pool.dedicated_or_create("0", || Ok(pooled_handle(&pool, &dedicated, Some("0"))))
            .unwrap();

        pool.drain(Duration::from_secs(5));
        pool.drain(Duration::from_secs(5));
        assert_eq!(queued.close_count(), 1);
        assert_eq!(dedicated.close_count(), 1);
        assert!(pool.checkout("tx-").is_none());
    }
}
