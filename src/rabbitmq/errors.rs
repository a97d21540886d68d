// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum HutchError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Failed to declare {kind} '{name}': {reason}")]
    DeclareError {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Failed to bind queue '{queue}' to exchange '{exchange}' with key '{routing_key}': {reason}")]
    BindError {
        queue: String,
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("Message serialization error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    #[error("Broker is closed")]
    BrokerClosed,

    #[error("Lock acquisition failed: {0}")]
    LockError(&'static str),

    #[error("Shutdown finished with {count} error(s): {details}")]
    ShutdownError { count: usize, details: String },
}

// Custom Result type for broker operations
pub type Result<T> = std::result::Result<T, HutchError>;

impl HutchError {
    /// Network-level failures a later dial can be expected to fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HutchError::ConnectionError(_) | HutchError::TimeoutError(_)
        )
    }
}

impl From<Elapsed> for HutchError {
    fn from(_: Elapsed) -> Self {
        HutchError::TimeoutError("Connection timed out".to_string())
    }
}
