use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("Invalid destination {id}: {reason}")]
    InvalidDestination { id: String, reason: String },

    #[error("Invalid secret for destination {0}")]
    InvalidSecret(String),

    #[error("Invalid work item {id}: {reason}")]
    InvalidWorkItem { id: String, reason: String },

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("HTTP {0}: transient status")]
    TransientStatus(u16),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {0}: unexpected status")]
    UnexpectedStatus(u16),

    #[error("Circuit open for destination {destination_id} until {broken_until}")]
    CircuitOpen {
        destination_id: String,
        broken_until: DateTime<Utc>,
    },

    #[error("Destination gone (HTTP 410)")]
    DestinationGone,

    #[error("Delivery failed after {attempts} attempts: {reason}")]
    DeliveryFailed { attempts: u32, reason: String },

    #[error("Shutdown in progress")]
    ShutdownInProgress,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SenderError {
    /// Whether the policy may schedule another attempt after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SenderError::TransientNetwork(_) | SenderError::TransientStatus(_) | SenderError::Timeout(_)
        )
    }

    /// Short label used for the `outcome`/`reason` metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            SenderError::InvalidDestination { .. } => "invalid_destination",
            SenderError::InvalidSecret(_) => "invalid_secret",
            SenderError::InvalidWorkItem { .. } => "invalid_work_item",
            SenderError::TransientNetwork(_) => "network",
            SenderError::TransientStatus(_) => "transient_status",
            SenderError::Timeout(_) => "timeout",
            SenderError::UnexpectedStatus(_) => "unexpected_status",
            SenderError::CircuitOpen { .. } => "circuit_open",
            SenderError::DestinationGone => "gone",
            SenderError::DeliveryFailed { .. } => "delivery_failed",
            SenderError::ShutdownInProgress => "shutdown",
            SenderError::Config(_) => "config",
            SenderError::Serialization(_) => "serialization",
        }
    }
}
