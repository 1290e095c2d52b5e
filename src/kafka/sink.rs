//! High-level send and transaction-scope operations over a handle factory.
//!
//! A [`KafkaSink`] never owns producers itself. Every operation resolves a
//! handle through the factory, uses it, then calls `close()` on it; the
//! handle's ownership tag decides whether that close is physical, a no-op,
//! or a pool release. Inside [`KafkaSink::execute_in_transaction`] the
//! resolved transactional handle is bound to the calling thread so sends
//! issued by the scope body land in the same transaction.

use crate::kafka::driver::DeliveryCallback;
use crate::kafka::error::{DeliveryError, SinkError};
use crate::kafka::factory::{HandleRequest, ProducerFactory};
use crate::kafka::handle::ProducerHandle;
use crate::kafka::listener::{DeliveryListener, LoggingDeliveryListener};
use crate::kafka::metrics::{MetricsSnapshot, SinkMetrics};
use crate::kafka::record::{RecordMetadata, SinkRecord, TopicPartitionOffset};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// The in-flight result of one send.
///
/// Fulfilled exactly once from the driver's completion thread with either
/// the broker-assigned metadata or the failed record and its cause. If the
/// completion callback is dropped without ever firing (driver shut down with
/// the record still queued), waiting yields [`SinkError::Incomplete`].
pub struct PendingDelivery {
    rx: Receiver<Result<RecordMetadata, DeliveryError>>,
}

impl PendingDelivery {
    /// Block until the delivery resolves.
    pub fn wait(&self) -> Result<RecordMetadata, SinkError> {
        match self.rx.recv() {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(e)) => Err(SinkError::Delivery(Box::new(e))),
            Err(_) => Err(SinkError::Incomplete),
        }
    }

    /// Block for at most `timeout`. Both a timeout and a dropped callback
    /// surface as [`SinkError::Incomplete`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<RecordMetadata, SinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(e)) => Err(SinkError::Delivery(Box::new(e))),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(SinkError::Incomplete)
            }
        }
    }

    /// Non-blocking poll; `None` while the delivery is still in flight.
    pub fn try_result(&self) -> Option<Result<RecordMetadata, SinkError>> {
        match self.rx.try_recv() {
            Ok(Ok(metadata)) => Some(Ok(metadata)),
            Ok(Err(e)) => Some(Err(SinkError::Delivery(Box::new(e)))),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(SinkError::Incomplete)),
        }
    }
}

pub struct KafkaSink {
    factory: Arc<ProducerFactory>,
    auto_flush: bool,
    allow_non_transactional: bool,
    transaction_id_prefix: Option<String>,
    default_topic: Option<String>,
    listener: Arc<dyn DeliveryListener>,
    /// Reports an externally coordinated transaction, if any
    transaction_probe: Option<Box<dyn Fn() -> bool + Send + Sync>>,
    /// Transaction handle per thread: a scope body's handle, or one bound
    /// on behalf of an external coordinator
    bound: Mutex<HashMap<ThreadId, BoundHandle>>,
    metrics: Arc<SinkMetrics>,
    close_timeout: Duration,
    flush_timeout: Duration,
    transaction_timeout: Duration,
}

impl KafkaSink {
    pub fn new(factory: Arc<ProducerFactory>) -> Self {
        KafkaSink {
            factory,
            auto_flush: false,
            allow_non_transactional: false,
            transaction_id_prefix: None,
            default_topic: None,
            listener: Arc::new(LoggingDeliveryListener),
            transaction_probe: None,
            bound: Mutex::new(HashMap::new()),
            metrics: Arc::new(SinkMetrics::new()),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    /// Flush after every send so results are known before `send` returns to
    /// the caller's loop. Expensive; intended for low-volume critical sends.
    pub fn with_auto_flush(mut self, enabled: bool) -> Self {
        self.auto_flush = enabled;
        self
    }

    /// Let a transaction-capable sink serve sends outside any transaction
    /// scope through fresh one-shot non-transactional handles.
    pub fn allow_non_transactional(mut self, allowed: bool) -> Self {
        self.allow_non_transactional = allowed;
        self
    }

    /// Override the factory's transaction id prefix for scopes started by
    /// this sink.
    pub fn transaction_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.transaction_id_prefix = Some(prefix.into());
        self
    }

    /// Topic used by [`Self::send_default`]
    pub fn default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    pub fn listener(mut self, listener: Arc<dyn DeliveryListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Hook for an outer transaction coordinator. While the probe reports an
    /// active transaction, sends outside a scope resolve a transactional
    /// handle, begin a transaction on it and bind it to the calling thread;
    /// the coordinator finishes it through
    /// [`Self::complete_external_transaction`].
    pub fn transaction_probe(
        mut self,
        probe: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Self {
        self.transaction_probe = Some(Box::new(probe));
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn is_transactional(&self) -> bool {
        self.factory.transaction_capable()
    }

    /// True when the calling thread runs inside a transaction scope of this
    /// sink, or an external probe reports an active transaction.
    pub fn in_transaction(&self) -> bool {
        if !self.is_transactional() {
            return false;
        }
        if self.bound_handle().is_some() {
            return true;
        }
        self.probe_reports_active()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Issue a send and return its pending result.
    ///
    /// Inside a transaction scope the scope's bound handle is used and kept
    /// open; the same goes for an external transaction reported by the
    /// configured probe, which binds a transactional handle on first use.
    /// Otherwise a transaction-capable sink either fails fast or (when
    /// explicitly allowed) uses a fresh one-shot handle that is physically
    /// closed from the completion callback.
    pub fn send(&self, record: SinkRecord) -> Result<PendingDelivery, SinkError> {
        let (handle, one_shot) = self.resolve_handle()?;
        let (tx, rx) = mpsc::sync_channel(1);

        let listener = self.listener.clone();
        let metrics = self.metrics.clone();
        let callback_record = record.clone();
        let closer = if one_shot { Some(handle.clone()) } else { None };
        let close_timeout = self.close_timeout;
        let issued = Instant::now();

        let on_delivery: DeliveryCallback = Box::new(move |result| {
            let latency = issued.elapsed();
            match result {
                Ok(metadata) => {
                    metrics.record_success(latency);
                    listener.on_success(&callback_record, &metadata);
                    let _ = tx.send(Ok(metadata));
                }
                Err(e) => {
                    metrics.record_failure(latency);
                    listener.on_failure(&callback_record, &e);
                    let _ = tx.send(Err(DeliveryError {
                        record: callback_record,
                        source: e,
                    }));
                }
            }
            if let Some(handle) = closer {
                handle.close(close_timeout);
            }
        });

        if let Err((e, record)) = handle.send(record, on_delivery) {
            if one_shot {
                handle.close(self.close_timeout);
            }
            return Err(SinkError::Delivery(Box::new(DeliveryError {
                record,
                source: e,
            })));
        }

        if self.auto_flush {
            handle.flush(self.flush_timeout)?;
        }
        Ok(PendingDelivery { rx })
    }

    /// Send `payload` (and optional `key`) to the configured default topic.
    pub fn send_default(
        &self,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
    ) -> Result<PendingDelivery, SinkError> {
        let topic = self.default_topic.as_deref().ok_or_else(|| {
            SinkError::Configuration("no default topic configured".to_string())
        })?;
        let mut record = SinkRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        self.send(record)
    }

    /// Block until previously issued sends are acknowledged.
    ///
    /// Resolves the producer the same way [`Self::send`] does, so a
    /// transaction-capable sink outside any scope fails fast here too.
    pub fn flush(&self) -> Result<(), SinkError> {
        let (handle, one_shot) = self.resolve_handle()?;
        let result = handle.flush(self.flush_timeout);
        if one_shot {
            handle.close(self.close_timeout);
        }
        Ok(result?)
    }

    /// Partition ids currently known for `topic`.
    pub fn partitions_for(&self, topic: &str) -> Result<Vec<i32>, SinkError> {
        let (handle, one_shot) = self.resolve_handle()?;
        let result = handle.partitions_for(topic, DEFAULT_METADATA_TIMEOUT);
        if one_shot {
            handle.close(self.close_timeout);
        }
        Ok(result?)
    }

    /// Attach consumed offsets to the current transaction so they commit or
    /// abort together with the produced records. Only valid inside a scope.
    pub fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartitionOffset],
        group_id: &str,
    ) -> Result<(), SinkError> {
        let handle = self.bound_handle().ok_or_else(|| {
            SinkError::TransactionState(
                "no transaction is in progress; offsets can only be attached inside \
                 execute_in_transaction"
                    .to_string(),
            )
        })?;
        Ok(handle.send_offsets_to_transaction(offsets, group_id, self.transaction_timeout)?)
    }

    /// Run `work` inside a producer transaction.
    ///
    /// Sends issued through this sink by `work` on the same thread use the
    /// scope's handle. `Ok` commits; `Err` aborts and propagates the work
    /// error (an abort failure is logged, never masks it); a commit failure
    /// propagates without an abort attempt, since the session state after a
    /// failed commit is unknown. The handle is always unbound and released
    /// on the way out, so a poisoned session reaches the pool's eviction
    /// path even when `work` panics.
    pub fn execute_in_transaction<T>(
        &self,
        work: impl FnOnce(&KafkaSink) -> Result<T, SinkError>,
    ) -> Result<T, SinkError> {
        if !self.is_transactional() {
            return Err(SinkError::TransactionState(
                "sink is not transactional; configure a transaction id prefix on the factory"
                    .to_string(),
            ));
        }
        let thread_id = thread::current().id();
        if self.bound.lock().unwrap().contains_key(&thread_id) {
            return Err(SinkError::TransactionState(
                "nested transaction scopes are not supported".to_string(),
            ));
        }

        let handle = self.begin_on_fresh_handle()?;
        self.bound.lock().unwrap().insert(
            thread_id,
            BoundHandle {
                handle: handle.clone(),
                external: false,
            },
        );
        let _guard = ScopeGuard {
            sink: self,
            handle: handle.clone(),
            thread_id,
        };

        match work(self) {
            Ok(value) => {
                handle.commit_transaction(self.transaction_timeout)?;
                Ok(value)
            }
            Err(work_error) => {
                if let Err(abort_error) = handle.abort_transaction(self.transaction_timeout) {
                    error!(
                        "failed to abort transaction after work error: {}",
                        abort_error
                    );
                }
                Err(work_error)
            }
        }
    }

    /// Commit (or abort) the externally coordinated transaction bound to the
    /// calling thread, then release its producer.
    ///
    /// The binding is created lazily by the first non-scope operation that
    /// runs while the configured [`Self::transaction_probe`] reports an
    /// active transaction; the coordinator must call this once that outer
    /// transaction completes. Errors if the thread has no external binding.
    pub fn complete_external_transaction(&self, commit: bool) -> Result<(), SinkError> {
        let thread_id = thread::current().id();
        let handle = {
            let mut bound = self.bound.lock().unwrap();
            match bound.get(&thread_id) {
                Some(entry) if entry.external => bound.remove(&thread_id).map(|e| e.handle),
                _ => None,
            }
        }
        .ok_or_else(|| {
            SinkError::TransactionState(
                "no externally coordinated transaction is bound to this thread".to_string(),
            )
        })?;

        let result = if commit {
            handle.commit_transaction(self.transaction_timeout)
        } else {
            handle.abort_transaction(self.transaction_timeout)
        };
        handle.close(self.close_timeout);
        Ok(result?)
    }

    fn probe_reports_active(&self) -> bool {
        self.transaction_probe.as_ref().map_or(false, |probe| probe())
    }

    fn bound_handle(&self) -> Option<Arc<ProducerHandle>> {
        self.bound
            .lock()
            .unwrap()
            .get(&thread::current().id())
            .map(|entry| entry.handle.clone())
    }

    /// Check out a transactional handle and open a transaction on it.
    fn begin_on_fresh_handle(&self) -> Result<Arc<ProducerHandle>, SinkError> {
        let mut request = HandleRequest::new();
        if let Some(prefix) = &self.transaction_id_prefix {
            request = request.tx_prefix(prefix.clone());
        }
        let handle = self.factory.create_handle_with(&request)?;
        if let Err(e) = handle.begin_transaction() {
            // failure already recorded on the handle; release evicts it
            handle.close(self.close_timeout);
            return Err(SinkError::Kafka(e));
        }
        Ok(handle)
    }

    /// Resolve the handle for a non-scope operation. The `bool` is true when
    /// the caller must `close()` the handle after use.
    fn resolve_handle(&self) -> Result<(Arc<ProducerHandle>, bool), SinkError> {
        if let Some(handle) = self.bound_handle() {
            return Ok((handle, false));
        }
        if self.is_transactional() {
            if self.probe_reports_active() {
                // joining an externally coordinated transaction: bind a
                // transactional handle so follow-up operations on this
                // thread share it until complete_external_transaction
                debug!("binding a transactional producer to an external transaction");
                let handle = self.begin_on_fresh_handle()?;
                self.bound.lock().unwrap().insert(
                    thread::current().id(),
                    BoundHandle {
                        handle: handle.clone(),
                        external: true,
                    },
                );
                return Ok((handle, false));
            }
            if !self.allow_non_transactional {
                return Err(SinkError::TransactionState(
                    "no transaction is in progress; wrap the operation in \
                     execute_in_transaction or enable allow_non_transactional"
                        .to_string(),
                ));
            }
            return Ok((self.factory.create_non_transactional_handle()?, true));
        }
        Ok((self.factory.create_handle()?, true))
    }
}

/// A transaction handle bound to one thread, tagged with who completes it:
/// the sink's own scope guard, or an external coordinator.
struct BoundHandle {
    handle: Arc<ProducerHandle>,
    external: bool,
}

/// Unbinds and releases the scope handle whatever way the scope exits.
struct ScopeGuard<'a> {
    sink: &'a KafkaSink,
    handle: Arc<ProducerHandle>,
    thread_id: ThreadId,
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.sink.bound.lock().unwrap().remove(&self.thread_id);
        if thread::panicking() {
            // errors are logged by the handle; nothing to propagate here
            let _ = self
                .handle
                .abort_transaction(self.sink.transaction_timeout);
        }
        self.handle.close(self.sink.close_timeout);
    }
}
