//! Error types for the journal adapter.

use crate::client::DropReason;
use thiserror::Error;

/// Main error type for journal, snapshot and query operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Fault reported by the store client (connection loss, server error).
    #[error("Store error: {0}")]
    Store(String),

    #[error("Wrong expected version on {stream}: expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: String,
        actual: String,
    },

    #[error("Subscription to {stream} dropped: {reason:?}")]
    SubscriptionDropped { stream: String, reason: DropReason },

    #[error("Persistent subscription {group} on {stream} disconnected: {reason:?}")]
    PersistentSubscriptionDropped {
        stream: String,
        group: String,
        reason: DropReason,
    },

    #[error("Type not registered: {0}")]
    TypeNotRegistered(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl JournalError {
    /// True for server-initiated drops, which callers may answer by resubscribing.
    pub fn is_dropped(&self) -> bool {
        matches!(
            self,
            JournalError::SubscriptionDropped { .. }
                | JournalError::PersistentSubscriptionDropped { .. }
        )
    }
}

impl From<serde_json::Error> for JournalError {
    fn from(e: serde_json::Error) -> Self {
        JournalError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for JournalError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        JournalError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for JournalError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        JournalError::Deserialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for JournalError {
    fn from(e: tokio::task::JoinError) -> Self {
        JournalError::InvalidOperation(format!("background task failed: {}", e))
    }
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;
