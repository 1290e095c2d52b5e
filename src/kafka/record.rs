use std::collections::HashMap;

/// Message metadata attached to a record as key/value string pairs.
///
/// Provides a small, clean API over the underlying map so callers never
/// deal with raw header bytes directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    headers: HashMap<String, String>,
}

impl Headers {
    /// Create an empty header set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, consuming and returning self for chaining
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|v| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.headers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over all header pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An outbound record: topic plus optional partition, key, payload,
/// timestamp and headers.
///
/// Built fluently, mirroring the driver's record builder:
///
/// ```
/// use streampool::SinkRecord;
///
/// let record = SinkRecord::to("orders")
///     .key(b"order-1".to_vec())
///     .payload(b"{\"qty\":3}".to_vec());
/// assert_eq!(record.topic, "orders");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SinkRecord {
    pub topic: String,
    pub partition: Option<i32>,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: Option<i64>,
    pub headers: Headers,
}

impl SinkRecord {
    /// Start building a record destined for `topic`
    pub fn to(topic: impl Into<String>) -> Self {
        SinkRecord {
            topic: topic.into(),
            ..Default::default()
        }
    }

    pub fn partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn key(mut self, key: Vec<u8>) -> Self {
        self.key = Some(key);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp_ms = Some(timestamp_ms);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Broker-assigned placement of a delivered record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
}

/// A consumer position to be committed as part of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl TopicPartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        TopicPartitionOffset {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}
