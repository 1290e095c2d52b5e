//! # streampool
//!
//! Pooled, transaction-aware producer lifecycle management for Apache Kafka,
//! built on `rdkafka`.
//!
//! ## Features
//!
//! - **Close-Safe Handles**: `close()` on a handle means "release", not
//!   "destroy" - the handle's owner (factory or pool) decides the physical
//!   fate of the underlying producer
//! - **Transactional Pooling**: idle transactional producers are cached per
//!   transaction-id prefix and reused; failed ones are evicted and closed
//! - **Partition-Dedicated Producers**: one pinned transactional producer
//!   per consumer-partition group, preventing zombie-producer duplicates
//! - **Transaction Scopes**: `execute_in_transaction` binds a producer to
//!   the calling thread so every send in the scope joins the transaction
//! - **Pending Deliveries**: each send returns a `PendingDelivery` that can
//!   be awaited, polled, or ignored
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use streampool::{FactoryConfig, KafkaSink, ProducerFactory, SinkRecord};
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FactoryConfig::new("localhost:9092")
//!         .client_id_prefix("order-service")
//!         .transaction_id_prefix("orders-tx-");
//!     let factory = Arc::new(ProducerFactory::new(config)?);
//!     let sink = KafkaSink::new(factory);
//!
//!     sink.execute_in_transaction(|sink| {
//!         let pending = sink.send(
//!             SinkRecord::to("orders")
//!                 .key(b"order-1".to_vec())
//!                 .payload(b"{\"qty\":3}".to_vec()),
//!         )?;
//!         pending.wait()?;
//!         Ok(())
//!     })?;
//!
//!     Ok(())
//! }
//! ```

pub mod kafka;

// Re-export main API at crate root for easy access
pub use kafka::{
    DeliveryCallback,
    DeliveryError,
    // Listener
    DeliveryListener,
    // Driver seam
    DriverConfig,
    DriverFactory,
    // Configuration
    FactoryConfig,
    HandleRequest,
    Headers,
    // Operations façade
    KafkaSink,
    LoggingDeliveryListener,
    MetricsSnapshot,
    PendingDelivery,
    ProducerDriver,
    // Core types
    ProducerFactory,
    ProducerHandle,
    RdKafkaDriverFactory,
    RecordMetadata,
    ReleaseOutcome,
    // Records
    SinkRecord,
    // Errors
    SinkError,
    TopicPartitionOffset,
    TransactionalPool,
    TxFailure,
    TxFailureKind,
};
