//! Handle factory: decides which producer strategy serves each request.
//!
//! Resolution order mirrors the lifecycle rules:
//!
//! 1. transactional + per-partition mode with a partition suffix → dedicated
//!    handle from the partition map (created under the map lock);
//! 2. transactional otherwise → idle handle from the per-prefix pool, or a
//!    fresh one with the next numeric suffix;
//! 3. per-thread mode → the calling thread's retained handle;
//! 4. otherwise → the shared singleton, built exactly once behind a
//!    double-checked lock.
//!
//! `teardown()` physically closes the singleton and every pooled/dedicated
//! handle; thread-bound handles are deliberately excluded and must be
//! released by their owning threads.

use crate::kafka::config::FactoryConfig;
use crate::kafka::driver::{DriverConfig, DriverFactory, ProducerDriver};
use crate::kafka::error::SinkError;
use crate::kafka::handle::ProducerHandle;
use crate::kafka::pool::TransactionalPool;
use crate::kafka::rdkafka_driver::RdKafkaDriverFactory;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, ThreadId};

/// Parameters for a single handle request.
///
/// The partition suffix is an explicit per-call token correlating a
/// transactional handle with a consumer-partition group; requests without
/// one fall back to the shared per-prefix pool.
#[derive(Debug, Clone, Default)]
pub struct HandleRequest {
    tx_prefix: Option<String>,
    partition_suffix: Option<String>,
}

impl HandleRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the factory's transaction id prefix for this request
    pub fn tx_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tx_prefix = Some(prefix.into());
        self
    }

    /// Pin the handle to a consumer-partition group
    pub fn partition_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.partition_suffix = Some(suffix.into());
        self
    }
}

pub struct ProducerFactory {
    config: FactoryConfig,
    driver_factory: Arc<dyn DriverFactory>,
    pool: Arc<TransactionalPool>,
    tx_suffix: AtomicU64,
    client_id_seq: AtomicU64,
    shared: RwLock<Option<Arc<ProducerHandle>>>,
    thread_bound: Mutex<HashMap<ThreadId, Arc<ProducerHandle>>>,
}

impl ProducerFactory {
    /// Create a factory backed by the rdkafka driver.
    pub fn new(config: FactoryConfig) -> Result<Self, SinkError> {
        Self::with_driver_factory(config, Arc::new(RdKafkaDriverFactory))
    }

    /// Create a factory with a custom driver factory (used by tests to
    /// substitute the in-memory driver).
    pub fn with_driver_factory(
        config: FactoryConfig,
        driver_factory: Arc<dyn DriverFactory>,
    ) -> Result<Self, SinkError> {
        config.validate()?;
        let pool = TransactionalPool::new(config.pool_capacity);
        Ok(ProducerFactory {
            config,
            driver_factory,
            pool,
            tx_suffix: AtomicU64::new(0),
            client_id_seq: AtomicU64::new(0),
            shared: RwLock::new(None),
            thread_bound: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn transaction_capable(&self) -> bool {
        self.config.transaction_capable()
    }

    pub fn producer_per_partition(&self) -> bool {
        self.config.producer_per_partition
    }

    /// Resolve a handle using the factory defaults.
    pub fn create_handle(&self) -> Result<Arc<ProducerHandle>, SinkError> {
        self.create_handle_with(&HandleRequest::new())
    }

    /// Resolve a handle with an overridden transaction id prefix.
    pub fn create_handle_for(&self, tx_prefix: &str) -> Result<Arc<ProducerHandle>, SinkError> {
        self.create_handle_with(&HandleRequest::new().tx_prefix(tx_prefix))
    }

    pub fn create_handle_with(
        &self,
        request: &HandleRequest,
    ) -> Result<Arc<ProducerHandle>, SinkError> {
        let prefix = request
            .tx_prefix
            .as_deref()
            .or(self.config.transaction_id_prefix.as_deref());

        if let Some(prefix) = prefix {
            if self.config.producer_per_partition {
                if let Some(suffix) = request.partition_suffix.as_deref() {
                    return self.pool.dedicated_or_create(suffix, || {
                        self.new_transactional_handle(prefix, suffix, Some(suffix.to_string()))
                    });
                }
            }
            return self.pooled_transactional_handle(prefix);
        }

        if self.config.producer_per_thread {
            return self.thread_bound_handle();
        }

        self.shared_handle()
    }

    /// Build a fresh handle outside every strategy: never retained, never
    /// pooled, physically closed by `close()`. Used for one-shot sends on a
    /// transaction-capable factory that explicitly allows them.
    pub fn create_non_transactional_handle(&self) -> Result<Arc<ProducerHandle>, SinkError> {
        let driver = self.new_raw_driver(None)?;
        Ok(ProducerHandle::detached(driver))
    }

    /// Remove and physically close the partition-dedicated handle for
    /// `suffix`. No-op when per-partition isolation is disabled or no such
    /// handle exists.
    pub fn close_handle_for(&self, suffix: &str) {
        if !self.config.producer_per_partition {
            return;
        }
        if let Some(handle) = self.pool.take_dedicated(suffix) {
            debug!("closing partition-dedicated producer for suffix '{}'", suffix);
            handle.driver().close(self.config.physical_close_timeout);
        }
    }

    /// Physically close and forget the calling thread's handle, if any.
    pub fn close_thread_bound_handle(&self) {
        let removed = self
            .thread_bound
            .lock()
            .unwrap()
            .remove(&thread::current().id());
        if let Some(handle) = removed {
            handle.driver().close(self.config.physical_close_timeout);
        }
    }

    /// Physically close the singleton and every pooled/dedicated handle.
    ///
    /// Idempotent and safe to call concurrently; thread-bound handles are
    /// excluded and stay owned by their threads.
    pub fn teardown(&self) {
        let singleton = self.shared.write().unwrap().take();
        if let Some(handle) = singleton {
            debug!("closing shared producer");
            handle.driver().close(self.config.physical_close_timeout);
        }
        self.pool.drain(self.config.physical_close_timeout);
    }

    /// Alias for [`Self::teardown`], matching the external lifecycle-stop
    /// signal.
    pub fn reset(&self) {
        self.teardown();
    }

    fn pooled_transactional_handle(
        &self,
        prefix: &str,
    ) -> Result<Arc<ProducerHandle>, SinkError> {
        if let Some(handle) = self.pool.checkout(prefix) {
            return Ok(handle);
        }
        let suffix = self.tx_suffix.fetch_add(1, Ordering::Relaxed).to_string();
        self.new_transactional_handle(prefix, &suffix, None)
    }

    fn new_transactional_handle(
        &self,
        prefix: &str,
        suffix: &str,
        partition_key: Option<String>,
    ) -> Result<Arc<ProducerHandle>, SinkError> {
        let transaction_id = format!("{}{}", prefix, suffix);
        let driver = self.new_raw_driver(Some(&transaction_id))?;
        if let Err(e) = driver.init_transactions(self.config.init_transactions_timeout) {
            driver.close(self.config.physical_close_timeout);
            return Err(SinkError::Kafka(e));
        }
        info!("initialized transactional producer '{}'", transaction_id);
        Ok(ProducerHandle::pooled(
            driver,
            transaction_id,
            &self.pool,
            prefix.to_string(),
            partition_key,
        ))
    }

    fn new_raw_driver(
        &self,
        transaction_id: Option<&str>,
    ) -> Result<Arc<dyn ProducerDriver>, SinkError> {
        let mut options: DriverConfig = self.config.base_driver_options();
        if let Some(tx_id) = transaction_id {
            options.insert("transactional.id", tx_id);
        }
        if let Some(prefix) = &self.config.client_id_prefix {
            // distinct client ids keep concurrently created sessions
            // individually identifiable to the broker
            let n = self.client_id_seq.fetch_add(1, Ordering::Relaxed) + 1;
            options.insert("client.id", format!("{}-{}", prefix, n));
        }
        self.driver_factory.create(&options)
    }

    fn thread_bound_handle(&self) -> Result<Arc<ProducerHandle>, SinkError> {
        let thread_id = thread::current().id();
        {
            let bound = self.thread_bound.lock().unwrap();
            if let Some(handle) = bound.get(&thread_id) {
                return Ok(handle.clone());
            }
        }
        // only this thread can insert under its own id, so creating outside
        // the lock cannot race into a duplicate
        let handle = ProducerHandle::retained(self.new_raw_driver(None)?);
        let mut bound = self.thread_bound.lock().unwrap();
        Ok(bound.entry(thread_id).or_insert(handle).clone())
    }

    fn shared_handle(&self) -> Result<Arc<ProducerHandle>, SinkError> {
        if let Some(handle) = self.shared.read().unwrap().as_ref() {
            return Ok(handle.clone());
        }
        let mut shared = self.shared.write().unwrap();
        // re-check: another thread may have won the race to construct
        if let Some(handle) = shared.as_ref() {
            return Ok(handle.clone());
        }
        let handle = ProducerHandle::retained(self.new_raw_driver(None)?);
        *shared = Some(handle.clone());
        Ok(handle)
    }
}

impl Drop for ProducerFactory {
    fn drop(&mut self) {
        self.teardown();
    }
}
