//! rdkafka-backed [`ProducerDriver`].
//!
//! One driver wraps one `BaseProducer` plus a dedicated poll thread that
//! drives delivery callbacks. The poll thread runs an adaptive loop:
//! tight-looping while messages are in flight, backing off to 1ms then 10ms
//! sleeps when idle. It is stopped around `flush` and every transaction verb
//! (flush and transaction operations must never race the poll loop - both
//! sides fighting over callbacks leads to slowdowns or timeouts) and
//! restarted afterwards unless the driver has been closed in the meantime.

use crate::kafka::driver::{DeliveryCallback, DriverConfig, DriverFactory, ProducerDriver};
use crate::kafka::error::SinkError;
use crate::kafka::record::{RecordMetadata, SinkRecord, TopicPartitionOffset};
use log::{debug, warn};
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer, ProducerContext};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use rdkafka_sys as rdsys;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Adaptive backoff thresholds for poll thread idle detection.
const IDLE_TIGHT_LOOP_THRESHOLD: u32 = 100;
const IDLE_SHORT_SLEEP_THRESHOLD: u32 = 1000;
const SHORT_SLEEP_MS: u64 = 1;
const LONG_SLEEP_MS: u64 = 10;

pub fn convert_kafka_log_level(kafka_level: RDKafkaLogLevel) -> log::Level {
    match kafka_level {
        RDKafkaLogLevel::Emerg | RDKafkaLogLevel::Alert | RDKafkaLogLevel::Critical => {
            log::Level::Error
        }
        RDKafkaLogLevel::Error => log::Level::Error,
        RDKafkaLogLevel::Warning => log::Level::Warn,
        RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => log::Level::Info,
        RDKafkaLogLevel::Debug => log::Level::Debug,
    }
}

/// Sized carrier for the boxed completion callback; the producer context's
/// delivery opaque must be a sized `IntoOpaque` type.
pub(crate) struct DeliveryOpaque {
    on_delivery: DeliveryCallback,
}

/// Client context that re-emits librdkafka logs through `log` and dispatches
/// per-message delivery reports to the callback carried in the opaque.
pub(crate) struct DeliveryContext;

impl ClientContext for DeliveryContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        log::log!(
            convert_kafka_log_level(level),
            "librdkafka [{}]: {}",
            fac,
            log_message
        );
    }

    fn error(&self, error: KafkaError, reason: &str) {
        log::error!("librdkafka error: {}: {}", error, reason);
    }
}

impl ProducerContext for DeliveryContext {
    type DeliveryOpaque = Box<DeliveryOpaque>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, delivery_opaque: Self::DeliveryOpaque) {
        let outcome = match delivery_result {
            Ok(message) => Ok(RecordMetadata {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                timestamp_ms: message.timestamp().to_millis(),
            }),
            Err((error, _message)) => Err(error.clone()),
        };
        (delivery_opaque.on_delivery)(outcome);
    }
}

struct PollState {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

fn adaptive_poll_loop(producer: Arc<BaseProducer<DeliveryContext>>, stop: Arc<AtomicBool>) {
    debug!("producer poll thread started");
    let mut idle_streak: u32 = 0;
    while !stop.load(Ordering::Relaxed) {
        producer.poll(Duration::from_millis(0));

        if producer.in_flight_count() == 0 {
            idle_streak = idle_streak.saturating_add(1);
            let sleep_ms = match idle_streak {
                0..=IDLE_TIGHT_LOOP_THRESHOLD => 0,
                ..=IDLE_SHORT_SLEEP_THRESHOLD => SHORT_SLEEP_MS,
                _ => LONG_SLEEP_MS,
            };
            if sleep_ms > 0 {
                thread::sleep(Duration::from_millis(sleep_ms));
            }
        } else {
            idle_streak = 0;
        }
    }
    // Drain remaining callbacks before exiting
    producer.poll(Duration::from_millis(100));
    debug!("producer poll thread stopped");
}

fn start_poll_thread(state: &mut PollState, producer: Arc<BaseProducer<DeliveryContext>>) {
    let stop = Arc::new(AtomicBool::new(false));
    state.stop = Arc::clone(&stop);
    state.thread = Some(thread::spawn(move || adaptive_poll_loop(producer, stop)));
}

fn stop_poll_thread(state: &mut PollState) {
    state.stop.store(true, Ordering::SeqCst);
    if let Some(handle) = state.thread.take() {
        if handle.thread().id() == thread::current().id() {
            // stopping from inside a delivery callback running on the poll
            // thread itself; the loop exits on the flag, joining would
            // deadlock
            return;
        }
        let _ = handle.join();
    }
}

pub struct RdKafkaDriver {
    producer: Arc<BaseProducer<DeliveryContext>>,
    poll: Mutex<PollState>,
    closed: AtomicBool,
}

impl RdKafkaDriver {
    pub fn new(config: &DriverConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        for (key, value) in config.iter() {
            client_config.set(key, value);
        }
        client_config.set_log_level(RDKafkaLogLevel::Info);

        let producer: BaseProducer<DeliveryContext> =
            client_config.create_with_context(DeliveryContext)?;
        let producer = Arc::new(producer);

        let mut poll = PollState {
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        start_poll_thread(&mut poll, Arc::clone(&producer));

        Ok(RdKafkaDriver {
            producer,
            poll: Mutex::new(poll),
            closed: AtomicBool::new(false),
        })
    }

    /// Run `op` with the poll thread stopped, restarting it afterwards
    /// unless the driver was closed in the meantime.
    fn with_poll_paused<T>(&self, op: impl FnOnce() -> T) -> T {
        let mut poll = self.poll.lock().unwrap();
        stop_poll_thread(&mut poll);
        let result = op();
        if !self.closed.load(Ordering::SeqCst) {
            start_poll_thread(&mut poll, Arc::clone(&self.producer));
        }
        result
    }
}

impl ProducerDriver for RdKafkaDriver {
    fn send(
        &self,
        record: SinkRecord,
        on_delivery: DeliveryCallback,
    ) -> Result<(), (KafkaError, SinkRecord)> {
        if self.closed.load(Ordering::SeqCst) {
            return Err((KafkaError::Canceled, record));
        }

        let opaque = Box::new(DeliveryOpaque { on_delivery });
        let mut base: BaseRecord<'_, [u8], [u8], Box<DeliveryOpaque>> =
            BaseRecord::with_opaque_to(&record.topic, opaque);
        base.partition = record.partition;
        base.timestamp = record.timestamp_ms;
        base.key = record.key.as_deref();
        base.payload = record.payload.as_deref();
        if !record.headers.is_empty() {
            let mut headers = OwnedHeaders::new();
            for (key, value) in record.headers.iter() {
                headers = headers.insert(Header {
                    key,
                    value: Some(value),
                });
            }
            base.headers = Some(headers);
        }

        match self.producer.send(base) {
            Ok(()) => Ok(()),
            Err((e, rejected)) => {
                // the rejected record borrows from `record`; release it
                // before handing the original back
                drop(rejected);
                Err((e, record))
            }
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.with_poll_paused(|| self.producer.flush(timeout))
    }

    fn partitions_for(&self, topic: &str, timeout: Duration) -> Result<Vec<i32>, KafkaError> {
        let metadata = self.producer.client().fetch_metadata(Some(topic), timeout)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            ))?;
        Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
    }

    fn init_transactions(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.with_poll_paused(|| self.producer.init_transactions(timeout))
    }

    fn begin_transaction(&self) -> Result<(), KafkaError> {
        self.with_poll_paused(|| self.producer.begin_transaction())
    }

    fn commit_transaction(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.with_poll_paused(|| self.producer.commit_transaction(timeout))
    }

    fn abort_transaction(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.with_poll_paused(|| self.producer.abort_transaction(timeout))
    }

    fn send_offsets_to_transaction(
        &self,
        offsets: &[TopicPartitionOffset],
        group_id: &str,
        timeout: Duration,
    ) -> Result<(), KafkaError> {
        if offsets.is_empty() {
            return Ok(());
        }
        let group = CString::new(group_id)
            .map_err(|_| KafkaError::Global(RDKafkaErrorCode::InvalidArgument))?;
        let topics = offsets
            .iter()
            .map(|o| CString::new(o.topic.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| KafkaError::Global(RDKafkaErrorCode::InvalidArgument))?;

        // rdkafka exposes no way to build consumer group metadata from a
        // bare group id, so this drops to the native API
        self.with_poll_paused(|| unsafe {
            let native_offsets = rdsys::rd_kafka_topic_partition_list_new(offsets.len() as i32);
            for (offset, topic) in offsets.iter().zip(&topics) {
                let element = rdsys::rd_kafka_topic_partition_list_add(
                    native_offsets,
                    topic.as_ptr(),
                    offset.partition,
                );
                (*element).offset = offset.offset;
            }
            let group_metadata = rdsys::rd_kafka_consumer_group_metadata_new(group.as_ptr());
            let error = rdsys::rd_kafka_send_offsets_to_transaction(
                self.producer.client().native_ptr(),
                native_offsets,
                group_metadata,
                timeout.as_millis() as i32,
            );
            rdsys::rd_kafka_consumer_group_metadata_destroy(group_metadata);
            rdsys::rd_kafka_topic_partition_list_destroy(native_offsets);

            if error.is_null() {
                Ok(())
            } else {
                let code: RDKafkaErrorCode = rdsys::rd_kafka_error_code(error).into();
                rdsys::rd_kafka_error_destroy(error);
                Err(KafkaError::Global(code))
            }
        })
    }

    fn close(&self, timeout: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing producer (timeout {:?})", timeout);
        let mut on_poll_thread = false;
        if let Ok(mut poll) = self.poll.try_lock() {
            on_poll_thread = poll
                .thread
                .as_ref()
                .map(|handle| handle.thread().id() == thread::current().id())
                .unwrap_or(false);
            stop_poll_thread(&mut poll);
        }
        // else: a paused-poll operation holds the lock; it observes the
        // closed flag and will not restart the loop
        if on_poll_thread {
            // closing from a delivery callback: flush polls internally, and
            // librdkafka does not allow nested polling from a callback. The
            // loop drains what remains once this callback returns.
            debug!("close issued from the poll thread, skipping final flush");
            return;
        }
        if let Err(e) = self.producer.flush(timeout) {
            warn!("flush during close failed: {}", e);
        }
    }
}

impl Drop for RdKafkaDriver {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(poll) = self.poll.get_mut() {
            stop_poll_thread(poll);
        }
    }
}

/// Default [`DriverFactory`] wiring [`RdKafkaDriver`] into the handle
/// factory.
pub struct RdKafkaDriverFactory;

impl DriverFactory for RdKafkaDriverFactory {
    fn create(&self, config: &DriverConfig) -> Result<Arc<dyn ProducerDriver>, SinkError> {
        Ok(Arc::new(RdKafkaDriver::new(config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    // No broker listens on this port; delivery fails after message.timeout.ms
    // and the report fires on the driver's own poll thread.
    #[test]
    fn test_close_from_a_delivery_callback_returns_without_flushing() {
        let config = DriverConfig::new()
            .set("bootstrap.servers", "127.0.0.1:1")
            .set("message.timeout.ms", "100");
        let driver = Arc::new(RdKafkaDriver::new(&config).unwrap());

        let (tx, rx) = mpsc::sync_channel(1);
        let closer = Arc::clone(&driver);
        driver
            .send(
                SinkRecord::to("orders").payload(b"p".to_vec()),
                Box::new(move |_result| {
                    let started = Instant::now();
                    closer.close(Duration::from_secs(30));
                    let _ = tx.send(started.elapsed());
                }),
            )
            .map_err(|(e, _)| e)
            .unwrap();

        let close_took = rx
            .recv_timeout(Duration::from_secs(15))
            .expect("delivery callback never fired");
        assert!(
            close_took < Duration::from_secs(5),
            "close blocked the poll thread for {:?}",
            close_took
        );
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(
            convert_kafka_log_level(RDKafkaLogLevel::Emerg),
            log::Level::Error
        );
        assert_eq!(
            convert_kafka_log_level(RDKafkaLogLevel::Warning),
            log::Level::Warn
        );
        assert_eq!(
            convert_kafka_log_level(RDKafkaLogLevel::Notice),
            log::Level::Info
        );
        assert_eq!(
            convert_kafka_log_level(RDKafkaLogLevel::Debug),
            log::Level::Debug
        );
    }
}
