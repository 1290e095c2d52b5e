//! In-memory driver and driver factory for exercising the lifecycle layer
//! without a broker.
//!
//! The mock records every driver call in order, can fail the next
//! send/begin/commit/abort on demand, and completes deliveries either
//! inline (`auto_succeed`) or under test control (`manual` +
//! [`MockDriver::complete_next_success`]).

use crate::kafka::driver::{
    DeliveryCallback, DriverConfig, DriverFactory, ProducerDriver,
};
use crate::kafka::error::SinkError;
use crate::kafka::record::{RecordMetadata, SinkRecord, TopicPartitionOffset};
use rdkafka::error::KafkaError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ready-made errors for failure scripting.
pub mod errors {
    use rdkafka::error::KafkaError;
    use rdkafka::types::RDKafkaErrorCode;

    pub fn generic() -> KafkaError {
        KafkaError::MessageProduction(RDKafkaErrorCode::Fail)
    }

    pub fn timeout() -> KafkaError {
        KafkaError::MessageProduction(RDKafkaErrorCode::OperationTimedOut)
    }

    pub fn fenced() -> KafkaError {
        KafkaError::MessageProduction(RDKafkaErrorCode::ProducerFenced)
    }

    pub fn queue_full() -> KafkaError {
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)
    }
}

/// How the mock resolves deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Deliveries stay pending until completed by the test
    Manual,
    /// Every send is acknowledged inline, before `send` returns
    AutoSucceed,
}

/// One recorded driver invocation, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Send,
    Flush,
    InitTransactions,
    BeginTransaction,
    CommitTransaction,
    AbortTransaction,
    SendOffsets,
    Close,
}

#[derive(Default)]
struct MockState {
    pending: VecDeque<(SinkRecord, DeliveryCallback)>,
    sent: Vec<SinkRecord>,
    calls: Vec<DriverCall>,
    close_timeouts: Vec<Duration>,
    offsets_sent: Vec<(Vec<TopicPartitionOffset>, String)>,
    fail_send: Option<KafkaError>,
    fail_init: Option<KafkaError>,
    fail_begin: Option<KafkaError>,
    fail_commit: Option<KafkaError>,
    fail_abort: Option<KafkaError>,
    init_count: usize,
    begin_count: usize,
    commit_count: usize,
    abort_count: usize,
    flush_count: usize,
    partitions: Vec<i32>,
    next_offset: i64,
}

pub struct MockDriver {
    mode: DeliveryMode,
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn manual() -> Arc<Self> {
        Self::with_mode(DeliveryMode::Manual)
    }

    pub fn auto_succeed() -> Arc<Self> {
        Self::with_mode(DeliveryMode::AutoSucceed)
    }

    fn with_mode(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(MockDriver {
            mode,
            state: Mutex::new(MockState {
                partitions: vec![0, 1, 2],
                ..Default::default()
            }),
        })
    }

    pub fn fail_next_send(&self, error: KafkaError) {
        self.state.lock().unwrap().fail_send = Some(error);
    }

    pub fn fail_next_init(&self, error: KafkaError) {
        self.state.lock().unwrap().fail_init = Some(error);
    }

    pub fn fail_next_begin(&self, error: KafkaError) {
        self.state.lock().unwrap().fail_begin = Some(error);
    }

    pub fn fail_next_commit(&self, error: KafkaError) {
        self.state.lock().unwrap().fail_commit = Some(error);
    }

    pub fn fail_next_abort(&self, error: KafkaError) {
        self.state.lock().unwrap().fail_abort = Some(error);
    }

    pub fn set_partitions(&self, partitions: Vec<i32>) {
        self.state.lock().unwrap().partitions = partitions;
    }

    /// Resolve the oldest pending delivery successfully, returning the
    /// metadata handed to its callback. Panics if nothing is pending.
    pub fn complete_next_success(&self) -> RecordMetadata {
        let (record, callback, offset) = {
            let mut state = self.state.lock().unwrap();
            let (record, callback) = state
                .pending
                .pop_front()
                .expect("no pending delivery to complete");
            let offset = state.next_offset;
            state.next_offset += 1;
            (record, callback, offset)
        };
        let metadata = RecordMetadata {
            topic: record.topic.clone(),
            partition: record.partition.unwrap_or(0),
            offset,
            timestamp_ms: record.timestamp_ms,
        };
        // invoked outside the lock: the callback may close this driver
        callback(Ok(metadata.clone()));
        metadata
    }

    /// Fail the oldest pending delivery. Panics if nothing is pending.
    pub fn complete_next_failure(&self, error: KafkaError) {
        let (_, callback) = {
            let mut state = self.state.lock().unwrap();
            state
                .pending
                .pop_front()
                .expect("no pending delivery to fail")
        };
        callback(Err(error));
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn sent_records(&self) -> Vec<SinkRecord> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn offsets_sent(&self) -> Vec<(Vec<TopicPartitionOffset>, String)> {
        self.state.lock().unwrap().offsets_sent.clone()
    }

    pub fn init_count(&self) -> usize {
        self.state.lock().unwrap().init_count
    }

    pub fn begin_count(&self) -> usize {
        self.state.lock().unwrap().begin_count
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().unwrap().commit_count
    }

    pub fn abort_count(&self) -> usize {
        self.state.lock().unwrap().abort_count
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().unwrap().flush_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().close_timeouts.len()
    }

    pub fn close_timeouts(&self) -> Vec<Duration> {
        self.state.lock().unwrap().close_timeouts.clone()
    }
}

impl ProducerDriver for MockDriver {
    fn send(
        &self,
        record: SinkRecord,
        on_delivery: DeliveryCallback,
    ) -> Result<(), (KafkaError, SinkRecord)> {
        let inline = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(DriverCall::Send);
            if let Some(error) = state.fail_send.take() {
                return Err((error, record));
            }
            state.sent.push(record.clone());
            match self.mode {
                DeliveryMode::Manual => {
                    state.pending.push_back((record, on_delivery));
                    None
                }
                DeliveryMode::AutoSucceed => {
                    let offset = state.next_offset;
                    state.next_offset += 1;
                    Some((
                        RecordMetadata {
                            topic: record.topic.clone(),
                            partition: record.partition.unwrap_or(0),
                            offset,
                            timestamp_ms: record.timestamp_ms,
                        },
                        on_delivery,
                    ))
                }
            }
        };
        if let Some((metadata, on_delivery)) = inline {
            on_delivery(Ok(metadata));
        }
        Ok(())
    }

    fn flush(&self, _timeout: Duration) -> Result<(), KafkaError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Flush);
        state.flush_count += 1;
        Ok(())
    }

    fn partitions_for(&self, _topic: &str, _timeout: Duration) -> Result<Vec<i32>, KafkaError> {
        Ok(self.state.lock().unwrap().partitions.clone())
    }

    fn init_transactions(&self, _timeout: Duration) -> Result<(), KafkaError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::InitTransactions);
        state.init_count += 1;
        match state.fail_init.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn begin_transaction(&self) -> Result<(), KafkaError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::BeginTransaction);
        state.begin_count += 1;
        match state.fail_begin.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn commit_transaction(&self, _timeout: Duration) -> Result<(), KafkaError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::CommitTransaction);
        state.commit_count += 1;
        match state.fail_commit.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn abort_transaction(&self, _timeout: Duration) -> Result<(), KafkaError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::AbortTransaction);
        state.abort_count += 1;
        match state.fail_abort.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartitionOffset],
        group_id: &str,
        _timeout: Duration,
    ) -> Result<(), KafkaError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::SendOffsets);
        state
            .offsets_sent
            .push((offsets.to_vec(), group_id.to_string()));
        Ok(())
    }

    fn close(&self, timeout: Duration) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(DriverCall::Close);
        state.close_timeouts.push(timeout);
    }
}

/// [`DriverFactory`] producing [`MockDriver`]s and remembering every
/// creation with the config it was given.
pub struct MockDriverFactory {
    mode: DeliveryMode,
    fail_create: Mutex<Option<KafkaError>>,
    fail_init: Mutex<Option<KafkaError>>,
    fail_send: Mutex<Option<KafkaError>>,
    created: Mutex<Vec<(DriverConfig, Arc<MockDriver>)>>,
}

impl MockDriverFactory {
    /// Factory for drivers whose deliveries stay pending until completed
    pub fn manual() -> Arc<Self> {
        Self::with_mode(DeliveryMode::Manual)
    }

    /// Factory for drivers that acknowledge every send inline
    pub fn auto_succeed() -> Arc<Self> {
        Self::with_mode(DeliveryMode::AutoSucceed)
    }

    fn with_mode(mode: DeliveryMode) -> Arc<Self> {
        Arc::new(MockDriverFactory {
            mode,
            fail_create: Mutex::new(None),
            fail_init: Mutex::new(None),
            fail_send: Mutex::new(None),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next driver construction
    pub fn fail_next_create(&self, error: KafkaError) {
        *self.fail_create.lock().unwrap() = Some(error);
    }

    /// Make the next created driver fail its `init_transactions`
    pub fn fail_next_init(&self, error: KafkaError) {
        *self.fail_init.lock().unwrap() = Some(error);
    }

    /// Make the next created driver reject its first send synchronously
    pub fn fail_next_send(&self, error: KafkaError) {
        *self.fail_send.lock().unwrap() = Some(error);
    }

    pub fn creation_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// The `index`-th created driver, in creation order
    pub fn driver(&self, index: usize) -> Arc<MockDriver> {
        self.created.lock().unwrap()[index].1.clone()
    }

    /// The config the `index`-th driver was created with
    pub fn config(&self, index: usize) -> DriverConfig {
        self.created.lock().unwrap()[index].0.clone()
    }
}

impl DriverFactory for MockDriverFactory {
    fn create(&self, config: &DriverConfig) -> Result<Arc<dyn ProducerDriver>, SinkError> {
        if let Some(error) = self.fail_create.lock().unwrap().take() {
            return Err(SinkError::Kafka(error));
        }
        let driver = MockDriver::with_mode(self.mode);
        if let Some(error) = self.fail_init.lock().unwrap().take() {
            driver.fail_next_init(error);
        }
        if let Some(error) = self.fail_send.lock().unwrap().take() {
            driver.fail_next_send(error);
        }
        self.created
            .lock()
            .unwrap()
            .push((config.clone(), driver.clone()));
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_mode_holds_deliveries() {
        let driver = MockDriver::manual();
        let delivered = Arc::new(Mutex::new(None));
        let sink = delivered.clone();
        driver
            .send(
                SinkRecord::to("t").partition(2),
                Box::new(move |result| *sink.lock().unwrap() = Some(result)),
            )
            .unwrap();

        assert_eq!(driver.pending_count(), 1);
        assert!(delivered.lock().unwrap().is_none());

        let metadata = driver.complete_next_success();
        assert_eq!(metadata.partition, 2);
        assert_eq!(delivered.lock().unwrap().as_ref().unwrap().as_ref().unwrap(), &metadata);
    }

    #[test]
    fn test_auto_mode_completes_inline() {
        let driver = MockDriver::auto_succeed();
        let delivered = Arc::new(Mutex::new(None));
        let sink = delivered.clone();
        driver
            .send(
                SinkRecord::to("t"),
                Box::new(move |result| *sink.lock().unwrap() = Some(result)),
            )
            .unwrap();

        assert_eq!(driver.pending_count(), 0);
        assert!(delivered.lock().unwrap().as_ref().unwrap().is_ok());
    }

    #[test]
    fn test_scripted_send_failure_returns_record() {
        let driver = MockDriver::manual();
        driver.fail_next_send(errors::queue_full());
        let result = driver.send(SinkRecord::to("t"), Box::new(|_| {}));
        let (_, record) = result.unwrap_err();
        assert_eq!(record.topic, "t");
        // subsequent sends succeed again
        assert!(driver.send(SinkRecord::to("t"), Box::new(|_| {})).is_ok());
    }
}
