//! Producer lifecycle management: close-safe handles, a factory with
//! shared/thread-bound/transactional strategies, per-prefix pooling of
//! transactional producers, and a high-level send/transaction façade.

pub mod config;
pub mod driver;
pub mod error;
pub mod factory;
pub mod handle;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod rdkafka_driver;
pub mod record;
pub mod sink;
pub mod testing;

pub use config::{FactoryConfig, DEFAULT_PHYSICAL_CLOSE_TIMEOUT};
pub use driver::{DeliveryCallback, DriverConfig, DriverFactory, ProducerDriver};
pub use error::{DeliveryError, SinkError, TxFailure, TxFailureKind};
pub use factory::{HandleRequest, ProducerFactory};
pub use handle::ProducerHandle;
pub use listener::{DeliveryListener, LoggingDeliveryListener};
pub use metrics::{MetricsSnapshot, SinkMetrics};
pub use pool::{ReleaseOutcome, TransactionalPool};
pub use rdkafka_driver::{RdKafkaDriver, RdKafkaDriverFactory};
pub use record::{Headers, RecordMetadata, SinkRecord, TopicPartitionOffset};
pub use sink::{KafkaSink, PendingDelivery};
