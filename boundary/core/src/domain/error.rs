// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Boundary error taxonomy.
//!
//! Two families reach the host:
//!
//! - [`BoundaryError`]: the trust boundary itself could not be established
//!   (caller synthesis or context attribution failed).
//! - [`ScriptError`]: the untrusted callable failed on its own. It passes
//!   through the boundary untouched.
//!
//! [`InvokeError`] is the union returned by
//! [`crate::PrivilegedInvoker::invoke`].

use thiserror::Error;

use super::callable::ScriptError;

/// A permission check rejected by a domain on the current frame stack.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessViolation {
    #[error("Permission '{permission}' is explicitly denied for domain '{origin}'")]
    ExplicitlyDenied { permission: String, origin: String },

    #[error("Permission '{permission}' is not granted to domain '{origin}'")]
    NotGranted { permission: String, origin: String },

    #[error("Target '{target}' of permission '{permission}' is outside allowlist {allowed:?}")]
    TargetOutsideAllowlist {
        permission: String,
        target: String,
        allowed: Vec<String>,
    },
}

/// Failure to define, link or construct a caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("Malformed caller template: {0}")]
    MalformedTemplate(String),

    #[error("Failed to define type '{name}': {reason}")]
    Define { name: String, reason: String },

    #[error("Failed to link type '{name}': {reason}")]
    Link { name: String, reason: String },

    #[error("Failed to construct instance of '{name}': {reason}")]
    Construct { name: String, reason: String },

    #[error("Caller synthesis aborted before completion")]
    Aborted,
}

/// Failure to resolve the context or domain a call must be attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributionError {
    #[error("No execution context is active on this thread")]
    NoActiveContext,

    #[error("Execution context '{0}' has been released")]
    ContextReleased(String),

    #[error("Security domain bound to '{0}' has been released")]
    DomainReleased(String),

    #[error("Not permitted to read the execution context: {0}")]
    PermissionDenied(#[source] AccessViolation),
}

/// The trust boundary could not be established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BoundaryError {
    #[error("Trust boundary synthesis failed for domain '{origin}': {source}")]
    Synthesis {
        origin: String,
        #[source]
        source: SynthesisError,
    },

    #[error("Trust boundary attribution failed: {0}")]
    Attribution(#[from] AttributionError),
}

/// Result error of a privileged invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvokeError {
    #[error(transparent)]
    Boundary(#[from] BoundaryError),

    #[error(transparent)]
    Script(#[from] ScriptError),
}

impl InvokeError {
    /// True when the boundary failed, false when the callable did.
    pub fn is_boundary_failure(&self) -> bool {
        matches!(self, InvokeError::Boundary(_))
    }

    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            InvokeError::Script(err) => Some(err),
            InvokeError::Boundary(_) => None,
        }
    }
}

impl From<AttributionError> for InvokeError {
    fn from(err: AttributionError) -> Self {
        InvokeError::Boundary(BoundaryError::Attribution(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boundary_failures_are_distinguishable() {
        let boundary: InvokeError = AttributionError::NoActiveContext.into();
        assert!(boundary.is_boundary_failure());
        assert!(boundary.as_script_error().is_none());

        let script: InvokeError = ScriptError::thrown(json!("boom")).into();
        assert!(!script.is_boundary_failure());
        assert_eq!(script.as_script_error(), Some(&ScriptError::thrown(json!("boom"))));
    }

    #[test]
    fn test_synthesis_error_keeps_cause_in_message() {
        let err = BoundaryError::Synthesis {
            origin: "https://example.com/a.js".to_string(),
            source: SynthesisError::Link {
                name: "boundary/CallerImpl".to_string(),
                reason: "defining context released".to_string(),
            },
        };
        let message = err.to_string();
        assert!(message.contains("https://example.com/a.js"));
        assert!(message.contains("defining context released"));
    }
}
