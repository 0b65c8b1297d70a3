//! Error taxonomy.
//!
//! Handler faults and lock contention are *outcomes*, reported through
//! [`ProcessingResult`](crate::ProcessingResult). Only the conditions below
//! escape [`WebhookGuard::process`](crate::WebhookGuard::process).

use thiserror::Error;

use crate::model::WebhookStatus;

pub type Result<T, E = GuardError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum GuardError {
    /// A status change the state machine does not allow, or one aimed at a
    /// record that does not exist (`from == None`).
    #[error("webhook {webhook_id}: cannot move from {} to {to}", display_from(.from))]
    InvalidTransition {
        webhook_id: String,
        from: Option<WebhookStatus>,
        to: WebhookStatus,
    },

    /// The handler output could not be encoded for storage, or a stored result
    /// could not be decoded into the caller's output type.
    #[error("webhook {webhook_id}: payload codec failed: {source}")]
    Payload {
        webhook_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Storage or lock infrastructure failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl GuardError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, GuardError::InvalidTransition { .. })
    }
}

fn display_from(from: &Option<WebhookStatus>) -> String {
    match from {
        Some(status) => status.to_string(),
        None => "<absent>".to_string(),
    }
}
