//! Channel configuration.
//!
//! One [`ChannelConfig`] per channel handle. Defaults match what the
//! machine dashboards ship with; every knob is overridable per channel
//! because the spray rig and the routing line live on very different
//! networks.

// Rust guideline compliant 2026-02

use std::time::Duration;

/// Default connect-attempt timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default base delay for reconnect backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the reconnect backoff delay.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default maximum number of automatic reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Default upper bound on the random jitter added to each backoff delay.
pub const DEFAULT_RECONNECT_JITTER: Duration = Duration::from_millis(250);

/// Default heartbeat interval while the channel is open.
///
/// The server expects regular liveness frames to keep connection state;
/// 30 seconds balances freshness against network overhead.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a machine channel or push-sync subscription.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL of the machine endpoint (`ws://` or `wss://`;
    /// `http(s)://` is converted automatically).
    pub url: String,
    /// Base delay for exponential reconnect backoff.
    pub reconnect_base_delay: Duration,
    /// Cap on the reconnect backoff delay.
    pub reconnect_max_delay: Duration,
    /// Automatic reconnect attempts before giving up. After this many
    /// failures the channel enters `Failed` and waits for a manual
    /// `reconnect()`.
    pub max_reconnect_attempts: u32,
    /// Upper bound on the random jitter added to each backoff delay.
    /// Zero disables jitter (useful in tests).
    pub reconnect_jitter: Duration,
    /// Interval between outbound liveness frames while open.
    ///
    /// There is no receive-timeout: the server is assumed to detect and
    /// drop dead peers. Half-open detection would hang off this config
    /// if it is ever needed.
    pub heartbeat_interval: Duration,
    /// Bound on a single connect attempt. Expiry counts as a failed
    /// attempt and drives the backoff policy.
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    /// Create a configuration for the given endpoint URL with defaults.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the reconnect backoff base delay.
    #[must_use]
    pub fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    /// Set the reconnect backoff delay cap.
    #[must_use]
    pub fn reconnect_max_delay(mut self, delay: Duration) -> Self {
        self.reconnect_max_delay = delay;
        self
    }

    /// Set the maximum number of automatic reconnect attempts.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set the jitter cap. Zero disables jitter.
    #[must_use]
    pub fn reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the connect-attempt timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
