//! Configuration for the client engine.

use serde_json::{Map, Value};
use std::time::Duration;

/// Configuration for a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator URL (`ws://` or `wss://`).
    pub url: String,
    /// Free-form options announced in `client-options-set`.
    pub options: Map<String, Value>,
    /// Announces `debug: true` and logs every frame at trace level.
    pub debug: bool,
    /// How often the heartbeat check runs.
    pub heartbeat_interval: Duration,
    /// Silence longer than this forces a reconnect.
    pub heartbeat_timeout: Duration,
    /// Reconnect scheduling.
    pub reconnect: ReconnectConfig,
    /// Timer resolution of the async session driver.
    pub tick_interval: Duration,
    /// Capacity of the session command queue.
    pub command_capacity: usize,
}

impl ClientConfig {
    /// Creates a new client configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            options: Map::new(),
            debug: false,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(20),
            reconnect: ReconnectConfig::default(),
            tick_interval: Duration::from_millis(250),
            command_capacity: 64,
        }
    }

    /// Adds an option to announce to the coordinator.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Sets the debug flag.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the heartbeat check interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the reconnect configuration.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Sets the session timer resolution.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Sets the session command queue capacity.
    pub fn with_command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }

    /// Options as sent on the wire.
    pub fn wire_options(&self) -> Map<String, Value> {
        let mut options = self.options.clone();
        if self.debug {
            options.insert("debug".into(), Value::Bool(true));
        }
        options
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("ws://127.0.0.1:3001")
    }
}

/// When to retry after the connection drops.
///
/// The default is a fixed one second delay. A multiplier above 1.0 turns it
/// into exponential backoff capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any retry delay.
    pub max_delay: Duration,
    /// Growth factor per consecutive failed attempt.
    pub backoff_multiplier: f64,
}

impl ReconnectConfig {
    /// Creates a fixed-delay configuration.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    /// Creates an exponential backoff configuration.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let capped = base.min(self.max_delay.as_secs_f64().max(self.initial_delay.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}
