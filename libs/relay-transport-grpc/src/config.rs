//! Outbound channel configuration.

use std::time::Duration;

/// Reconnection backoff parameters.
///
/// Delays grow as `base * multiplier^n`, capped at `max`, and are spread by
/// `±jitter` (a fraction of the delay).
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 1.6,
            jitter: 0.2,
            max: Duration::from_secs(30),
        }
    }
}

/// Configuration for the supervised outbound channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Timeout for a single TCP/TLS connect attempt.
    pub connect_timeout: Duration,

    /// Default deadline for one forwarded call, reconnect and retry included.
    pub call_timeout: Duration,

    /// TCP keepalive probe interval.
    pub tcp_keepalive: Option<Duration>,

    /// HTTP/2 PING interval.
    pub http2_keep_alive_interval: Duration,

    /// How long to wait for a PING ack before declaring the connection dead.
    pub keep_alive_timeout: Duration,

    /// Whether to send PINGs when no call is in flight.
    pub keep_alive_while_idle: bool,

    /// Backoff between connect attempts within one establish.
    pub backoff: BackoffConfig,

    /// Total time one establish may spend dialling before it gives up.
    pub establish_budget: Duration,

    /// Fixed pause between establish attempts at startup.
    pub startup_retry_interval: Duration,

    /// Service name for tracing.
    pub service_name: &'static str,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(120)),
            http2_keep_alive_interval: Duration::from_secs(120),
            keep_alive_timeout: Duration::from_secs(20),
            keep_alive_while_idle: false,
            backoff: BackoffConfig::default(),
            establish_budget: Duration::from_secs(5),
            startup_retry_interval: Duration::from_secs(5),
            service_name: "observer",
        }
    }
}

impl ChannelConfig {
    /// Create a new configuration with the given service name.
    #[must_use]
    pub fn new(service_name: &'static str) -> Self {
        Self {
            service_name,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_establish_budget(mut self, budget: Duration) -> Self {
        self.establish_budget = budget;
        self
    }

    #[must_use]
    pub fn with_startup_retry_interval(mut self, interval: Duration) -> Self {
        self.startup_retry_interval = interval;
        self
    }
}
