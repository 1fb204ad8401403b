//! Error kinds surfaced by the engine facade.
//!
//! Internal plumbing uses `anyhow`; everything that crosses the public
//! [`Engine`](crate::Engine) boundary is converted into an [`EngineError`]
//! so hosts can branch on the kind (abort on `Execution`, retry on
//! `Timeout`, and so on).

use std::time::Duration;

/// Errors returned by the engine facade.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Bad registration input (empty name, missing source, unknown hook, duplicate).
    #[error("validation failed: {0}")]
    Validation(String),

    /// File read or top-level evaluation failure while loading a script.
    #[error("failed to load script '{name}': {message}")]
    Load {
        /// File path or inline script name.
        name: String,
        /// Underlying failure.
        message: String,
    },

    /// Runtime error inside a script or callback, or `execute` returned false.
    #[error("hook '{hook}' failed in {by}: {message}")]
    Execution {
        /// Hook being dispatched (or task type for task handlers).
        hook: String,
        /// Failing script name or callback identifier.
        by: String,
        /// Interpreter error message.
        message: String,
    },

    /// Script did not complete within the configured window.
    #[error("hook '{hook}' timed out in {by} after {timeout:?}")]
    Timeout {
        /// Hook being dispatched.
        hook: String,
        /// Failing script name or callback identifier.
        by: String,
        /// Configured per-script timeout.
        timeout: Duration,
    },

    /// A script or callback stopped the execution context.
    #[error("hook '{hook}' stopped by {by}: {reason}")]
    Stopped {
        /// Hook being dispatched.
        hook: String,
        /// Script name or callback identifier that called `stop`.
        by: String,
        /// Reason passed to `stop`.
        reason: String,
    },

    /// Engine closed, or an optional host API is not configured.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl EngineError {
    /// Returns `true` for [`EngineError::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Re-tag an invocation failure with the hook and script/callback that caused it.
    #[must_use]
    pub(crate) fn tagged(self, hook: &str, by: &str) -> Self {
        match self {
            Self::Execution { message, .. } => Self::Execution {
                hook: hook.to_string(),
                by: by.to_string(),
                message,
            },
            Self::Timeout { timeout, .. } => Self::Timeout {
                hook: hook.to_string(),
                by: by.to_string(),
                timeout,
            },
            Self::Stopped { reason, .. } => Self::Stopped {
                hook: hook.to_string(),
                by: by.to_string(),
                reason,
            },
            other => other,
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
