use tracing::{info, warn};

use crate::error::ApiError;
use crate::mutation::MutationVerb;

/// Outcome of a mutation, as reported to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Success {
        verb: MutationVerb,
        message: String,
    },
    Failure {
        verb: MutationVerb,
        /// Operation intent, e.g. "Failed to update application".
        title: String,
        error: ApiError,
    },
}

impl Notification {
    pub fn verb(&self) -> MutationVerb {
        match self {
            Notification::Success { verb, .. } | Notification::Failure { verb, .. } => *verb,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Notification::Failure { .. })
    }

    /// One-line text suitable for a toast or a log line.
    pub fn summary(&self) -> String {
        match self {
            Notification::Success { message, .. } => message.clone(),
            Notification::Failure { title, error, .. } => {
                if error.message().is_empty() {
                    title.clone()
                } else {
                    format!("{}: {}", title, error.message())
                }
            }
        }
    }
}

/// Receives mutation outcomes. Implemented by whatever renders them.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Default sink: writes outcomes to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::Success { verb, message } => {
                info!(operation = %verb, "{}", message);
            }
            Notification::Failure { verb, title, error } => {
                warn!(operation = %verb, status = error.status(), error = %error, "{}", title);
            }
        }
    }
}
