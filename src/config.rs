use std::time::Duration;

use thiserror::Error;

use crate::cli::Serve;
use crate::message::EXIT_COMMAND;

pub const DEFAULT_MAX_MESSAGE: usize = 1024;
pub const DEFAULT_QUEUE_DEPTH: usize = 500;
pub const DEFAULT_MAX_CLIENTS: usize = 500;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("max message size {size} cannot hold the exit command ({min} bytes)")]
    MessageTooSmall { size: usize, min: usize },
}

/// Capacity constants of the server core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Largest frame read from a client, and largest payload enqueued.
    pub max_message: usize,
    /// Pending messages the queue holds before producers block.
    pub queue_depth: usize,
    /// Connections the registry admits before refusing new ones.
    pub max_clients: usize,
    /// Per-recipient write timeout used by the broadcaster. `None` blocks forever.
    pub write_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message: DEFAULT_MAX_MESSAGE,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_clients: DEFAULT_MAX_CLIENTS,
            write_timeout: Some(Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS)),
        }
    }
}

impl Limits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message == 0 {
            return Err(ConfigError::Zero { field: "max message size" });
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Zero { field: "queue depth" });
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Zero { field: "max clients" });
        }
        if self.max_message < EXIT_COMMAND.len() {
            return Err(ConfigError::MessageTooSmall {
                size: self.max_message,
                min: EXIT_COMMAND.len(),
            });
        }
        Ok(())
    }
}

impl From<&Serve> for Limits {
    fn from(serve: &Serve) -> Self {
        Self {
            max_message: serve.max_message,
            queue_depth: serve.queue_depth,
            max_clients: serve.max_clients,
            // 0 disables the timeout
            write_timeout: (serve.write_timeout_ms > 0)
                .then(|| Duration::from_millis(serve.write_timeout_ms)),
        }
    }
}
