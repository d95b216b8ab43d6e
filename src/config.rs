use crate::endpoint::Endpoint;
use std::time::Duration;

/// Default quiet period before a burst of subscribe/unsubscribe calls is applied
pub const DEFAULT_TOPIC_DEBOUNCE: Duration = Duration::from_millis(50);

/// Default pause between tearing down a socket and reopening it with new topics
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(50);

/// Configuration for the topic manager
#[derive(Debug, Clone)]
pub struct TopicManagerConfig {
    /// Where to connect
    pub endpoint: Endpoint,
    /// Connection-related settings
    pub connection: ConnectionConfig,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Liveness monitoring settings
    pub health: HealthConfig,
    /// Debounce window for topic-set recomputation
    pub topic_debounce: Duration,
    /// Delay between closing a socket and reopening it after a topic change
    pub settle_delay: Duration,
}

impl Default for TopicManagerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            connection: ConnectionConfig::default(),
            backoff: BackoffConfig::default(),
            health: HealthConfig::default(),
            topic_debounce: DEFAULT_TOPIC_DEBOUNCE,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl TopicManagerConfig {
    /// Create a new builder for configuration
    pub fn builder() -> TopicManagerConfigBuilder {
        TopicManagerConfigBuilder::default()
    }
}

/// Builder for TopicManagerConfig
#[derive(Debug, Clone, Default)]
pub struct TopicManagerConfigBuilder {
    config: TopicManagerConfig,
}

impl TopicManagerConfigBuilder {
    /// Set the endpoint
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.config.backoff = config;
        self
    }

    /// Set health configuration
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.config.health = config;
        self
    }

    /// Set the topic debounce window
    pub fn topic_debounce(mut self, debounce: Duration) -> Self {
        self.config.topic_debounce = debounce;
        self
    }

    /// Set the settle delay used when reconnecting after a topic change
    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.config.settle_delay = delay;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g., max_attempts = 0).
    pub fn build(self) -> Result<TopicManagerConfig, ConfigError> {
        let backoff = &self.config.backoff;
        if backoff.max_delay < backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if backoff.multiplier <= 0.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be > 0".to_string(),
            ));
        }

        if backoff.max_attempts == 0 {
            return Err(ConfigError::InvalidBackoff(
                "max_attempts must be > 0".to_string(),
            ));
        }

        if self.config.health.ping_timeout.is_zero() {
            return Err(ConfigError::InvalidHealth(
                "ping_timeout must be > 0".to_string(),
            ));
        }

        if self.config.connection.connect_timeout.is_zero() {
            return Err(ConfigError::InvalidConnection(
                "connect_timeout must be > 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid health configuration
    #[error("Invalid health configuration: {0}")]
    InvalidHealth(String),
    /// Invalid connection configuration
    #[error("Invalid connection configuration: {0}")]
    InvalidConnection(String),
    /// Invalid endpoint (origin, host or path)
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Connection-related configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection (TCP + TLS + handshake)
    pub connect_timeout: Duration,
    /// How long to wait for a close frame to flush before dropping the socket
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(1),
        }
    }
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Reconnection attempts before giving up for good
    pub max_attempts: u32,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (1-indexed).
    ///
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`. Attempt 0 is
    /// treated as attempt 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }

    /// Whether another attempt may be scheduled after `attempts_so_far` failures
    pub fn allows_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }
}

/// Liveness monitoring configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Maximum silence between server heartbeats before the socket is declared dead
    pub ping_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(45),
        }
    }
}
