use crate::kafka::driver::DriverConfig;
use crate::kafka::error::SinkError;
use log::{info, warn};
use std::collections::HashMap;
use std::time::Duration;

/// The default physical close timeout applied during teardown and eviction.
pub const DEFAULT_PHYSICAL_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`crate::ProducerFactory`] with sensible defaults.
///
/// Setting a transaction id prefix enables transaction capability and forces
/// the driver's idempotent-delivery option on, unless it was explicitly
/// disabled (which is flagged as a possible-duplicates warning, not an
/// error).
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Comma-separated broker addresses
    pub brokers: String,
    /// Prefix for generated per-handle `client.id`s
    pub client_id_prefix: Option<String>,
    /// Prefix for generated `transactional.id`s; enables transactions
    pub transaction_id_prefix: Option<String>,
    /// Keep one dedicated transactional handle per consumer-partition suffix
    pub producer_per_partition: bool,
    /// Keep one non-transactional handle per calling thread
    pub producer_per_thread: bool,
    /// Timeout for physically closing handles on teardown/eviction
    pub physical_close_timeout: Duration,
    /// Timeout for the one-time transaction initialization of a new handle
    pub init_transactions_timeout: Duration,
    /// Bound on idle handles kept per transaction-id prefix; `None` = unbounded
    pub pool_capacity: Option<usize>,
    /// Additional driver options passed through verbatim
    pub custom: HashMap<String, String>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        FactoryConfig {
            brokers: "localhost:9092".to_string(),
            client_id_prefix: None,
            transaction_id_prefix: None,
            producer_per_partition: true,
            producer_per_thread: false,
            physical_close_timeout: DEFAULT_PHYSICAL_CLOSE_TIMEOUT,
            init_transactions_timeout: Duration::from_secs(60),
            pool_capacity: None,
            custom: HashMap::new(),
        }
    }
}

impl FactoryConfig {
    /// Create a new config for the given brokers
    pub fn new(brokers: impl Into<String>) -> Self {
        FactoryConfig {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Build a config from a raw driver option map.
    ///
    /// `bootstrap.servers` is required. A `client.id` becomes the per-handle
    /// client id prefix and a `transactional.id` becomes the transaction id
    /// prefix (it is suffixed per handle for concurrent transaction
    /// support); both are removed from the pass-through options.
    pub fn from_options(mut options: HashMap<String, String>) -> Result<Self, SinkError> {
        let brokers = options.remove("bootstrap.servers").ok_or_else(|| {
            SinkError::Configuration("'bootstrap.servers' is required".to_string())
        })?;
        let mut config = FactoryConfig::new(brokers);
        config.client_id_prefix = options.remove("client.id");
        if let Some(tx_id) = options.remove("transactional.id") {
            info!(
                "'transactional.id' config with value '{}' will be suffixed for concurrent transaction support",
                tx_id
            );
            config.transaction_id_prefix = Some(tx_id);
        }
        config.custom = options;
        config.validate()?;
        Ok(config)
    }

    /// Set the per-handle client id prefix
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = Some(prefix.into());
        self
    }

    /// Set the transaction id prefix, enabling transaction capability
    pub fn transaction_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.transaction_id_prefix = Some(prefix.into());
        self
    }

    /// Enable/disable the dedicated handle per consumer-partition suffix
    pub fn producer_per_partition(mut self, enabled: bool) -> Self {
        self.producer_per_partition = enabled;
        self
    }

    /// Enable/disable one handle per calling thread
    pub fn producer_per_thread(mut self, enabled: bool) -> Self {
        self.producer_per_thread = enabled;
        self
    }

    pub fn physical_close_timeout(mut self, timeout: Duration) -> Self {
        self.physical_close_timeout = timeout;
        self
    }

    pub fn init_transactions_timeout(mut self, timeout: Duration) -> Self {
        self.init_transactions_timeout = timeout;
        self
    }

    /// Bound the number of idle handles kept per transaction-id prefix
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Add a custom driver option passed through verbatim
    pub fn custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    pub fn transaction_capable(&self) -> bool {
        self.transaction_id_prefix.is_some()
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if self.brokers.trim().is_empty() {
            return Err(SinkError::Configuration(
                "'brokers' cannot be empty".to_string(),
            ));
        }
        if let Some(prefix) = &self.transaction_id_prefix {
            if prefix.trim().is_empty() {
                return Err(SinkError::Configuration(
                    "'transaction_id_prefix' cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Derive the base driver option map shared by every handle.
    ///
    /// Per-handle copies get `transactional.id`/`client.id` appended by the
    /// factory. When transactions are enabled, idempotence is forced on
    /// unless it was explicitly disabled.
    pub fn base_driver_options(&self) -> DriverConfig {
        let mut options = DriverConfig::new();
        options.insert("bootstrap.servers", self.brokers.clone());
        for (key, value) in &self.custom {
            options.insert(key.clone(), value.clone());
        }
        if self.transaction_capable() {
            match options.get("enable.idempotence") {
                Some("false") => {
                    warn!("'enable.idempotence' is explicitly disabled with transactions enabled; may result in duplicate messages");
                }
                Some(_) => {}
                None => options.insert("enable.idempotence", "true"),
            }
        }
        options
    }
}
