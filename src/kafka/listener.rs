//! Delivery outcome notifications.

use crate::kafka::record::{RecordMetadata, SinkRecord};
use log::error;
use rdkafka::error::KafkaError;

/// Observes the final outcome of every send issued through a
/// [`crate::KafkaSink`]. Invoked on the driver's completion thread, so
/// implementations must be quick and must not block.
pub trait DeliveryListener: Send + Sync {
    fn on_success(&self, _record: &SinkRecord, _metadata: &RecordMetadata) {}

    fn on_failure(&self, _record: &SinkRecord, _error: &KafkaError) {}
}

/// Default listener: logs failures, stays silent on success.
pub struct LoggingDeliveryListener;

impl DeliveryListener for LoggingDeliveryListener {
    fn on_failure(&self, record: &SinkRecord, error: &KafkaError) {
        error!(
            "delivery failed for record to topic '{}': {}",
            record.topic, error
        );
    }
}
