use crate::kafka::record::SinkRecord;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

/// Unified error type for the producer pooling and transaction layer.
#[derive(Debug)]
pub enum SinkError {
    /// Invalid or missing configuration, surfaced at construction
    Configuration(String),
    /// Operation attempted in the wrong transactional state
    TransactionState(String),
    /// Underlying Kafka library error
    Kafka(KafkaError),
    /// An individual send failed; carries the original record and cause
    Delivery(Box<DeliveryError>),
    /// The delivery callback was dropped without ever resolving
    Incomplete,
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            SinkError::TransactionState(msg) => write!(f, "transaction state error: {}", msg),
            SinkError::Kafka(e) => write!(f, "Kafka error: {}", e),
            SinkError::Delivery(e) => write!(f, "{}", e),
            SinkError::Incomplete => write!(f, "send result unavailable: delivery never resolved"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Kafka(e) => Some(e),
            SinkError::Delivery(e) => Some(&e.source),
            SinkError::Configuration(_) | SinkError::TransactionState(_) | SinkError::Incomplete => {
                None
            }
        }
    }
}

impl From<KafkaError> for SinkError {
    fn from(err: KafkaError) -> Self {
        SinkError::Kafka(err)
    }
}

/// Failure of one send, keeping the record that could not be delivered so
/// callers and listeners can inspect or retry it.
#[derive(Debug)]
pub struct DeliveryError {
    pub record: SinkRecord,
    pub source: KafkaError,
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to send record to topic '{}': {}",
            self.record.topic, self.source
        )
    }
}

impl std::error::Error for DeliveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Failure domain of a transactional operation, driving the close/evict
/// decision when a handle is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxFailureKind {
    /// Broker did not respond in time; the session may hang on close
    Timeout,
    /// A newer producer with the same transactional id took over
    Fenced,
    /// Any other failure
    Other,
}

/// A recorded transactional failure on a handle.
#[derive(Debug, Clone)]
pub struct TxFailure {
    pub kind: TxFailureKind,
    pub error: KafkaError,
}

impl TxFailure {
    pub fn new(error: KafkaError) -> Self {
        TxFailure {
            kind: classify_tx_failure(&error),
            error,
        }
    }
}

/// Classify a Kafka error from a begin/commit/abort into a failure domain.
pub fn classify_tx_failure(error: &KafkaError) -> TxFailureKind {
    match error {
        KafkaError::Transaction(e) => code_kind(e.code()),
        KafkaError::MessageProduction(code) => code_kind(*code),
        KafkaError::Flush(code) => code_kind(*code),
        KafkaError::Global(code) => code_kind(*code),
        _ => TxFailureKind::Other,
    }
}

fn code_kind(code: RDKafkaErrorCode) -> TxFailureKind {
    match code {
        RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => {
            TxFailureKind::Timeout
        }
        RDKafkaErrorCode::Fenced | RDKafkaErrorCode::ProducerFenced => TxFailureKind::Fenced,
        _ => TxFailureKind::Other,
    }
}
