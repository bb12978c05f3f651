//! Error handling types for the messaging core.
//!
//! Transport and configuration failures surface as [`MsbError`]. Failures
//! raised by application message handlers travel as [`HandlerError`] and are
//! translated into broker-level acknowledgements by the dispatch layer.

use std::sync::PoisonError;
use thiserror::Error;

/// Error type for messaging operations
#[derive(Debug, Error)]
pub enum MsbError {
    /// Publishing to or subscribing on the broker failed
    #[error("Transport error on topic {topic}: {message}")]
    Transport { topic: String, message: String },

    /// A second handler was attached to a topic that already has one
    #[error("Topic already has a subscribed handler: {topic}")]
    AlreadySubscribed { topic: String },

    /// Topic name does not match the topic grammar
    #[error("Invalid topic name: {topic}")]
    InvalidTopic { topic: String },

    /// A response was requested for a message that carries no response topic
    #[error("Message {message_id} has no response topic")]
    MissingResponseTopic { message_id: String },

    /// The conversation was torn down before it reached a terminal state
    #[error("Conversation {correlation_id} was aborted")]
    ConversationAborted { correlation_id: String },

    /// The conversation ended without any payload message
    #[error("Conversation {correlation_id} ended without a response")]
    NoResponse { correlation_id: String },

    /// Envelope or payload (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// The messaging context has been shut down
    #[error("Messaging context is shut down")]
    ShutDown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for messaging operations
pub type MsbResult<T> = Result<T, MsbError>;

/// Error returned by application message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by application message handlers.
pub type HandlerResult = Result<(), HandlerError>;

/// Helper trait to recover guards from poisoned locks.
pub trait LockResultExt<T> {
    /// Return the guard, logging a warning if the lock was poisoned.
    ///
    /// The context parameter identifies which operation triggered lock recovery,
    /// helping developers debug thread safety issues.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "msb::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Helper functions for common error patterns
impl MsbError {
    /// Create a transport error
    pub fn transport(topic: impl Into<String>, message: impl Into<String>) -> Self {
        MsbError::Transport {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create an already-subscribed error
    pub fn already_subscribed(topic: impl Into<String>) -> Self {
        MsbError::AlreadySubscribed {
            topic: topic.into(),
        }
    }

    /// Create an invalid topic error
    pub fn invalid_topic(topic: impl Into<String>) -> Self {
        MsbError::InvalidTopic {
            topic: topic.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        MsbError::Config {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        MsbError::Internal(message.into())
    }

    /// Whether the error originates from the broker transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, MsbError::Transport { .. })
    }
}
