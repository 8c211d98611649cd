//! Tunables for the hub and for every session it serves.

use std::time::Duration;

use crate::error::ServerError;

/// Default time a peer may stay silent before it is disconnected.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default number of lines that may wait in a session's outgoing queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// Default number of control messages that may wait for the broker.
pub const DEFAULT_HUB_CAPACITY: usize = 64;

/// Default longest line a peer may send before its session is closed.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Default time a closing connection gets to flush its outgoing queue.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Duration of silence after which a session is forcibly closed.
    pub idle_timeout: Duration,
    /// Backpressure threshold of each session's outgoing queue.
    pub queue_capacity: usize,
    /// Capacity of the broker's control channel.
    pub hub_capacity: usize,
    /// Longest accepted input line, in bytes.
    pub max_line_length: usize,
    /// How long teardown waits for pending lines to reach a peer before dropping the connection.
    pub close_grace: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            hub_capacity: DEFAULT_HUB_CAPACITY,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            close_grace: DEFAULT_CLOSE_GRACE,
        }
    }
}

impl HubConfig {
    pub fn new(idle_timeout: Duration, queue_capacity: usize, hub_capacity: usize) -> Result<HubConfig, ServerError> {
        let config = HubConfig {
            idle_timeout,
            queue_capacity,
            hub_capacity,
            ..HubConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_line_length(self, max_line_length: usize) -> Result<HubConfig, ServerError> {
        let config = HubConfig { max_line_length, ..self };
        config.validate()?;
        Ok(config)
    }

    pub fn with_close_grace(self, close_grace: Duration) -> HubConfig {
        HubConfig { close_grace, ..self }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.idle_timeout.is_zero() {
            return Err(ServerError::Config(String::from("idle timeout must be greater than zero")));
        }
        if self.queue_capacity == 0 {
            return Err(ServerError::Config(String::from("queue capacity must be at least 1")));
        }
        if self.hub_capacity == 0 {
            return Err(ServerError::Config(String::from("hub capacity must be at least 1")));
        }
        if self.max_line_length == 0 {
            return Err(ServerError::Config(String::from("max line length must be at least 1")));
        }
        Ok(())
    }
}
