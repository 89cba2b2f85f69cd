// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use std::fmt::Display;

use docubot_core::CoreError;
use thiserror::Error;

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Reading or writing durable state failed
    #[error("persistence error: {0}")]
    Persistence(#[from] CoreError),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A durable step failed and was not (or no longer) retried
    #[error("step '{label}' failed: {source}")]
    Step {
        /// Step label
        label: String,
        /// Failure reported by the step
        source: StepError,
    },

    /// An at-most-once step was started before a crash and never recorded an
    /// outcome. The side effect may or may not have happened.
    #[error("step '{label}' was interrupted; its effect may have been lost")]
    AtMostOnceInterrupted {
        /// Step label
        label: String,
    },

    /// An at-most-once step failed. It is never re-run.
    #[error("step '{label}' failed: {message}")]
    AtMostOnceFailed {
        /// Step label
        label: String,
        /// Recorded failure
        message: String,
    },

    /// No workflow is registered for an instance's kind
    #[error("unknown workflow kind: {0}")]
    UnknownWorkflow(String),

    /// Runtime misconfiguration
    #[error("configuration error: {0}")]
    Config(String),

    /// The runtime is shutting down
    #[error("instance cancelled")]
    Cancelled,

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SdkError {
    /// Whether re-running the failed work may succeed.
    ///
    /// The runtime retries an iteration that failed with a retryable error and
    /// fails the instance otherwise, unless the workflow opts into
    /// [`Workflow::retries_fatal`](crate::Workflow::retries_fatal).
    pub fn is_retryable(&self) -> bool {
        match self {
            SdkError::Persistence(e) => matches!(
                e,
                CoreError::DatabaseError { .. } | CoreError::CheckpointSaveFailed { .. }
            ),
            SdkError::Step { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

/// Failure reported by a step closure.
///
/// Steps classify their own failures: retryable ones are re-run with backoff,
/// fatal ones propagate immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StepError {
    /// Transient failure (network, rate limit, conflict)
    #[error("{0}")]
    Retryable(String),

    /// Failure that will not go away by retrying
    #[error("{0}")]
    Fatal(String),
}

impl StepError {
    /// Create a retryable error from any displayable value.
    pub fn retryable(err: impl Display) -> Self {
        StepError::Retryable(err.to_string())
    }

    /// Create a fatal error from any displayable value.
    pub fn fatal(err: impl Display) -> Self {
        StepError::Fatal(err.to_string())
    }

    /// Returns true for [`StepError::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Retryable(_))
    }
}

impl From<SdkError> for StepError {
    fn from(err: SdkError) -> Self {
        if err.is_retryable() {
            StepError::Retryable(err.to_string())
        } else {
            StepError::Fatal(err.to_string())
        }
    }
}

impl From<CoreError> for StepError {
    fn from(err: CoreError) -> Self {
        SdkError::from(err).into()
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Fatal(err.to_string())
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;
