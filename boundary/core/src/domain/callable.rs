// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Contract for untrusted script callables and the errors they raise.

use serde_json::Value;
use thiserror::Error;

use super::access::AccessController;
use super::error::AccessViolation;
use super::execution_context::ExecutionContext;
use super::security_domain::{Permission, SecurityDomain};

/// What a callable sees of the invocation it runs in.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    context: &'a ExecutionContext,
    domain: &'a SecurityDomain,
}

impl<'a> CallContext<'a> {
    pub fn new(context: &'a ExecutionContext, domain: &'a SecurityDomain) -> Self {
        Self { context, domain }
    }

    pub fn execution_context(&self) -> &'a ExecutionContext {
        self.context
    }

    pub fn domain(&self) -> &'a SecurityDomain {
        self.domain
    }

    /// Shorthand for [`AccessController::check_permission`].
    pub fn check_permission(&self, permission: &Permission) -> Result<(), AccessViolation> {
        AccessController::check_permission(permission)
    }
}

/// An externally supplied script function.
pub trait Callable: Send + Sync {
    fn call(
        &self,
        cx: &CallContext<'_>,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, ScriptError>;
}

impl<F> Callable for F
where
    F: Fn(&CallContext<'_>, &Value, &[Value]) -> Result<Value, ScriptError> + Send + Sync,
{
    fn call(
        &self,
        cx: &CallContext<'_>,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, ScriptError> {
        self(cx, this, args)
    }
}

/// A failure raised by script code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    /// A value thrown by the script's `throw`.
    #[error("{}", thrown_details(.value, .source_name, .line_number))]
    Thrown {
        value: Value,
        source_name: String,
        line_number: u32,
    },

    #[error("Access denied: {0}")]
    AccessDenied(#[from] AccessViolation),

    #[error("Host error: {0}")]
    Host(String),
}

impl ScriptError {
    /// A thrown value without location information.
    pub fn thrown(value: Value) -> Self {
        Self::thrown_at(value, "", 0)
    }

    pub fn thrown_at(value: Value, source_name: impl Into<String>, line_number: u32) -> Self {
        ScriptError::Thrown {
            value,
            source_name: source_name.into(),
            line_number,
        }
    }

    /// The thrown value, if this is a script `throw`.
    pub fn value(&self) -> Option<&Value> {
        match self {
            ScriptError::Thrown { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Human-readable rendering of the error payload.
    pub fn details(&self) -> String {
        match self {
            ScriptError::Thrown { value, .. } => value_details(value),
            other => other.to_string(),
        }
    }
}

fn value_details(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Object(map) => match (map.get("name"), map.get("message")) {
            (Some(Value::String(name)), Some(Value::String(message))) => {
                format!("{name}: {message}")
            }
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn thrown_details(value: &Value, source_name: &str, line_number: &u32) -> String {
    let details = value_details(value);
    if source_name.is_empty() {
        details
    } else {
        format!("{details} ({source_name}#{line_number})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_thrown_details() {
        assert_eq!(ScriptError::thrown(Value::Null).details(), "null");
        assert_eq!(ScriptError::thrown(json!("boom")).details(), "boom");
        assert_eq!(ScriptError::thrown(json!(42)).details(), "42");
        assert_eq!(
            ScriptError::thrown(json!({"name": "TypeError", "message": "x is undefined"}))
                .details(),
            "TypeError: x is undefined"
        );
    }

    #[test]
    fn test_display_includes_location_when_known() {
        let err = ScriptError::thrown_at(json!("boom"), "plugin.js", 12);
        assert_eq!(err.to_string(), "boom (plugin.js#12)");
        assert_eq!(err.value(), Some(&json!("boom")));
        assert_eq!(ScriptError::thrown(json!("boom")).to_string(), "boom");
    }

    #[test]
    fn test_closures_are_callables() {
        let add = |_: &CallContext<'_>, _: &Value, args: &[Value]| -> Result<Value, ScriptError> {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(sum))
        };
        let context = ExecutionContext::root("test");
        let domain = SecurityDomain::all_permissions("https://example.com");
        let cx = CallContext::new(&context, &domain);
        assert_eq!(
            Callable::call(&add, &cx, &Value::Null, &[json!(1), json!(2)]),
            Ok(json!(3))
        );
    }
}
