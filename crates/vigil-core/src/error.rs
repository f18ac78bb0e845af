// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the vigil pipeline.

use thiserror::Error;
use uuid::Uuid;

/// Pipeline errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Broker operation failed.
    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    /// Broker connect attempt exceeded its deadline.
    #[error("Broker connect timed out")]
    BrokerConnectTimeout,

    /// Broker connection dropped (detected via heartbeat probe).
    #[error("Broker connection lost")]
    BrokerConnectionLost,

    /// Dedup cache operation failed.
    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Message body could not be decoded into an envelope at all.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A required envelope field is absent.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// An envelope field is present but unusable.
    #[error("Invalid field {field}: {message}")]
    InvalidField {
        /// Field name as it appears on the wire.
        field: &'static str,
        /// What made the value unusable.
        message: String,
    },

    /// Result carried a status outside pass/warn/fail/error.
    #[error("Invalid run status: {0}")]
    InvalidStatus(String),

    /// Result referenced a project that does not exist (or is deleted).
    #[error("Project not found: {0}")]
    ProjectNotFound(Uuid),

    /// Result referenced a check that does not exist under its project.
    #[error("Check not found: {check_id} in project {project_id}")]
    CheckNotFound {
        /// Owning project id from the envelope.
        project_id: Uuid,
        /// Check id from the envelope.
        check_id: Uuid,
    },
}

impl Error {
    /// Per-message handling policy for the result consumer.
    ///
    /// Terminal errors can never succeed on redelivery and are rejected
    /// without requeue. Non-terminal errors are connection-level and are
    /// resolved by tearing the session down and reconnecting; the broker
    /// redelivers any unacknowledged messages afterwards.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Error::Broker(_) | Error::BrokerConnectTimeout | Error::BrokerConnectionLost
        )
    }
}

/// Result type using the pipeline Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_are_not_terminal() {
        assert!(!Error::BrokerConnectionLost.is_terminal());
        assert!(!Error::BrokerConnectTimeout.is_terminal());
    }

    #[test]
    fn message_errors_are_terminal() {
        assert!(Error::MalformedMessage("not json".into()).is_terminal());
        assert!(Error::MissingField("correlation_id").is_terminal());
        assert!(Error::InvalidStatus("unknown".into()).is_terminal());
        assert!(Error::ProjectNotFound(Uuid::new_v4()).is_terminal());
    }
}
