use std::time::Duration;

/// Service configuration. Every knob maps to one observable behavior; the
/// defaults mirror what the service ships with in production.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client id prefix used to derive the group member id.
    pub client_id: String,
    /// Max queued items per internal bounded channel. Smaller values make
    /// `ConsumeError::BufferOverflow` fire earlier.
    pub channel_buffer_size: usize,
    /// Max time a consume request is parked waiting for a message.
    pub long_polling_timeout: Duration,
    /// Max idle time before a dispatcher deregisters from its group.
    pub registration_timeout: Duration,
    /// Sleep before retrying after a transient fetch or metadata error.
    pub retry_backoff: Duration,
    /// Broker-side fetch shaping.
    pub fetch_min_bytes: i32,
    pub fetch_max_bytes: i32,
    pub fetch_max_partition_bytes: i32,
    pub fetch_max_wait: Duration,
    /// Per-broker network read timeout.
    pub read_timeout: Duration,
    /// Metadata refresh attempts before the error is surfaced to waiters.
    pub metadata_retry_max: u32,
    /// When true, partition fetchers expose an error channel carrying one
    /// record per disruption. Disabled by default; disruptions are logged
    /// either way.
    pub return_errors: bool,
}

impl Config {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_id: "kafka-mux".into(),
            channel_buffer_size: 256,
            long_polling_timeout: Duration::from_secs(3),
            registration_timeout: Duration::from_secs(20),
            retry_backoff: Duration::from_millis(500),
            fetch_min_bytes: 1,
            fetch_max_bytes: 52428800,          // 50 * 1024 * 1024
            fetch_max_partition_bytes: 1048576, // 1 * 1024 * 1024
            fetch_max_wait: Duration::from_millis(250),
            read_timeout: Duration::from_secs(30),
            metadata_retry_max: 3,
            return_errors: false,
        }
    }
}
