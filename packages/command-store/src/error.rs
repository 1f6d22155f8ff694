//! Structured error types for the coordinator, rules and durable storage.
//!
//! # The Error Boundary Rule
//!
//! > **No `anyhow::Error` escapes a dispatch.**
//!
//! - `anyhow` is internal transport (ergonomic inside rules and operations)
//! - A rule failure becomes a [`RuleFailure`], is logged, and is reported in
//!   the [`crate::DispatchReport`]; siblings still run
//! - An operation failure is logged and dispatches nothing
//! - Callers only ever see [`CoordinatorError`]
//!
//! ```ignore
//! match coordinator.dispatch(cmd).await {
//!     Ok(report) if report.failed.is_empty() => {}
//!     Ok(report) => {
//!         for failure in &report.failed {
//!             tracing::warn!(rule = failure.rule(), "rule failed: {}", failure);
//!         }
//!     }
//!     Err(CoordinatorError::Disposed) => return,
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::durable::Revision;

// =============================================================================
// Coordinator Error
// =============================================================================

/// Errors returned by the coordinator surface.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The coordinator was disposed; it accepts no more commands.
    #[error("coordinator has been disposed")]
    Disposed,

    /// Timeout waiting for pending operations to settle.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },
}

// =============================================================================
// Rule Failure
// =============================================================================

/// Which part of a rule was running when it panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePhase {
    Condition,
    Apply,
}

impl fmt::Display for RulePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RulePhase::Condition => write!(f, "condition"),
            RulePhase::Apply => write!(f, "apply"),
        }
    }
}

/// A rule that could not produce a result for a command.
#[derive(Debug, Error)]
pub enum RuleFailure {
    /// `apply` returned an error.
    #[error("rule {rule} rejected the command: {source}")]
    Rejected {
        rule: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// `condition` or `apply` panicked.
    #[error("rule {rule} panicked in {phase}: {message}")]
    Panicked {
        rule: &'static str,
        phase: RulePhase,
        message: String,
    },
}

impl RuleFailure {
    /// Name of the failing rule.
    pub fn rule(&self) -> &'static str {
        match self {
            RuleFailure::Rejected { rule, .. } | RuleFailure::Panicked { rule, .. } => rule,
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, RuleFailure::Panicked { .. })
    }
}

// =============================================================================
// Store Error
// =============================================================================

/// Errors from durable repositories.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic concurrency conflict.
    #[error("revision conflict: expected {expected}, found {actual}")]
    Conflict { expected: Revision, actual: Revision },

    #[error("failed to encode durable state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode durable state: {0}")]
    Decode(#[source] serde_json::Error),

    /// The record was written with a schema this build cannot read.
    #[error("unsupported durable schema version {found} (current is {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Backend-specific error (IO, poisoned lock).
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
