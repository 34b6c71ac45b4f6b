//! Reconcile error taxonomy and the requeue policy derived from it.

use std::time::Duration;

use thiserror::Error;

use crate::exec::ExecError;
use crate::store::StoreError;

/// Errors returned by reconcilers.
///
/// The controller loop is the only place that turns these into retry or drop
/// decisions, see [`Error::disposition`].
#[derive(Error, Debug)]
pub enum Error {
    /// A required input object does not exist yet.
    #[error("dependent resources not ready: {0}")]
    DependentResourcesNotReady(String),

    /// A required input exists but is semantically incomplete. Retrying cannot help.
    #[error("dependent config not valid: {0}")]
    DependentConfigNotValid(String),

    /// Waiting on a runtime/status signal.
    #[error("conditions not ready: {0}")]
    ConditionsNotReady(String),

    /// A remote command ran and failed; retried after the task-specific delay.
    #[error("remote exec failed: {message}")]
    ExecFailed {
        message: String,
        retry_after: Duration,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("exec transport error: {0}")]
    Exec(#[from] ExecError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What the controller loop does with a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Put the key back after `Some(delay)`, or after the controller's retry delay.
    Requeue(Option<Duration>),
    /// Log and forget.
    Drop,
}

impl Error {
    /// Conflicts (stale resourceVersion) always requeue, whatever wraps them.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict(_)))
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::DependentResourcesNotReady(_)
                | Error::ConditionsNotReady(_)
                | Error::ExecFailed { .. }
        )
    }

    #[must_use]
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::ExecFailed { retry_after, .. } => Disposition::Requeue(Some(*retry_after)),
            e if e.is_conflict() || e.is_retryable() => Disposition::Requeue(None),
            _ => Disposition::Drop,
        }
    }

    pub fn not_ready(what: impl Into<String>) -> Self {
        Error::DependentResourcesNotReady(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Error::DependentConfigNotValid(what.into())
    }

    pub fn waiting(what: impl Into<String>) -> Self {
        Error::ConditionsNotReady(what.into())
    }
}
