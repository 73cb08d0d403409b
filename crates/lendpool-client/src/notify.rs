//! user-facing status reporting
//!
//! the orchestrator reports progress through a [`NotificationSink`] and never
//! waits on it or checks that anything was shown. a sink that needs to do
//! slow work should hand the notification off to its own task.

use serde::{Deserialize, Serialize};

use crate::ledger::OperationHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Pending,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub stage: Stage,
    pub message: String,
    pub handle: Option<OperationHandle>,
}

impl Notification {
    pub fn pending(message: impl Into<String>, handle: Option<OperationHandle>) -> Self {
        Self {
            stage: Stage::Pending,
            message: message.into(),
            handle,
        }
    }

    pub fn success(message: impl Into<String>, handle: Option<OperationHandle>) -> Self {
        Self {
            stage: Stage::Success,
            message: message.into(),
            handle,
        }
    }

    /// `handle` is the last write issued before the failure, if any
    pub fn error(message: impl Into<String>, handle: Option<OperationHandle>) -> Self {
        Self {
            stage: Stage::Error,
            message: message.into(),
            handle,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    /// fire and forget
    fn notify(&self, notification: Notification);
}

/// writes notifications to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, n: Notification) {
        let handle = n.handle.map(|h| h.to_string()).unwrap_or_default();
        match n.stage {
            Stage::Pending => tracing::info!(tx = %handle, "⏳ {}", n.message),
            Stage::Success => tracing::info!(tx = %handle, "✓ {}", n.message),
            Stage::Error => tracing::error!(tx = %handle, "✗ {}", n.message),
        }
    }
}

/// drops everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _notification: Notification) {}
}
