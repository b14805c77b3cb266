// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Synthesized caller instances.
//!
//! A [`CachedCaller`] executes the linked `call` body of its type on a frame
//! attributed to the type's domain. The body only shuffles its arguments onto
//! an operand stack and forwards them to the target, so whatever the target
//! returns or raises passes through unchanged.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::access::AccessController;
use crate::domain::callable::{CallContext, Callable};
use crate::domain::error::{AttributionError, BoundaryError, InvokeError, SynthesisError};
use crate::domain::security_domain::SecurityDomain;

use super::loader::LoadedType;
use super::template::Instruction;

enum Operand<'a, 'cx> {
    Target(&'a dyn Callable),
    Context(&'a CallContext<'cx>),
    This(&'a Value),
    Args(&'a [Value]),
    Result(Value),
}

pub struct CachedCaller {
    loaded: Arc<LoadedType>,
    instance_id: Uuid,
}

impl CachedCaller {
    pub(crate) fn new(loaded: Arc<LoadedType>) -> Self {
        Self {
            loaded,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn loaded_type(&self) -> &Arc<LoadedType> {
        &self.loaded
    }

    pub fn origin(&self) -> &str {
        self.loaded.origin()
    }

    /// The attributed domain, while it is alive.
    pub fn domain(&self) -> Option<SecurityDomain> {
        self.loaded.weak_domain().upgrade()
    }

    /// Invoke `target` on a frame attributed to this caller's domain.
    pub fn call(
        &self,
        target: &dyn Callable,
        cx: &CallContext<'_>,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        let domain = self
            .domain()
            .ok_or_else(|| AttributionError::DomainReleased(self.loaded.origin().to_string()))?;
        let code = self.loaded.call_code().ok_or_else(|| self.broken("type has not been linked"))?;

        let _frame = AccessController::enter_domain(domain);

        let mut stack: Vec<Operand<'_, '_>> = Vec::with_capacity(5);
        for instruction in code.iter() {
            match instruction {
                Instruction::LoadLocal(slot) => stack.push(match slot {
                    1 => Operand::Target(target),
                    2 => Operand::Context(cx),
                    3 => Operand::This(this),
                    4 => Operand::Args(args),
                    _ => return Err(self.broken("load of an unknown local")),
                }),
                Instruction::InvokeInterface { arity, .. } => {
                    if stack.len() < usize::from(*arity) + 1 {
                        return Err(self.broken("operand stack underflow"));
                    }
                    let operands = stack.split_off(stack.len() - usize::from(*arity) - 1);
                    match operands.as_slice() {
                        [
                            Operand::Target(receiver),
                            Operand::Context(cx),
                            Operand::This(this),
                            Operand::Args(args),
                        ] => {
                            let result = receiver.call(cx, this, args)?;
                            stack.push(Operand::Result(result));
                        }
                        _ => return Err(self.broken("operands do not match the target signature")),
                    }
                }
                Instruction::ReturnValue => {
                    return match stack.pop() {
                        Some(Operand::Result(value)) => Ok(value),
                        _ => Err(self.broken("return without a result")),
                    };
                }
                other => return Err(self.broken(&format!("unexpected instruction {other:?}"))),
            }
        }
        Err(self.broken("call does not return"))
    }

    fn broken(&self, reason: &str) -> InvokeError {
        InvokeError::Boundary(BoundaryError::Synthesis {
            origin: self.loaded.origin().to_string(),
            source: SynthesisError::Link {
                name: self.loaded.name().to_string(),
                reason: reason.to_string(),
            },
        })
    }
}

impl fmt::Debug for CachedCaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCaller")
            .field("instance_id", &self.instance_id)
            .field("type", &self.loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::callable::ScriptError;
    use crate::domain::execution_context::ExecutionContext;
    use crate::domain::security_domain::{Grant, Permission};
    use crate::infrastructure::loader::TrustBoundaryLoader;
    use crate::infrastructure::template::caller_template;
    use serde_json::json;

    fn caller_for(context: &ExecutionContext, domain: &SecurityDomain) -> CachedCaller {
        TrustBoundaryLoader::new(context, domain)
            .define_and_link("boundary/CallerImpl", caller_template())
            .unwrap()
            .instantiate()
            .unwrap()
    }

    #[test]
    fn test_forwards_arguments_and_result() {
        let context = ExecutionContext::root("app");
        let domain = SecurityDomain::all_permissions("https://example.com");
        let caller = caller_for(&context, &domain);

        let echo =
            |_: &CallContext<'_>, this: &Value, args: &[Value]| -> Result<Value, ScriptError> {
                Ok(json!({ "this": this, "args": args }))
            };
        let cx = CallContext::new(&context, &domain);
        let result = caller.call(&echo, &cx, &json!("self"), &[json!(1), json!("two")]).unwrap();
        assert_eq!(result, json!({ "this": "self", "args": [1, "two"] }));
    }

    #[test]
    fn test_call_is_attributed_to_domain() {
        let context = ExecutionContext::root("app");
        let domain = SecurityDomain::builder("https://reader.example.com")
            .grant(Grant::new("fs.read"))
            .build();
        let caller = caller_for(&context, &domain);

        let probe = |cx: &CallContext<'_>, _: &Value, _: &[Value]| -> Result<Value, ScriptError> {
            let origin = AccessController::current_domain().map(|d| d.origin().to_string());
            let can_write = cx.check_permission(&Permission::new("fs.write")).is_ok();
            Ok(json!({ "origin": origin, "can_write": can_write }))
        };
        let cx = CallContext::new(&context, &domain);
        let result = caller.call(&probe, &cx, &Value::Null, &[]).unwrap();
        assert_eq!(result, json!({ "origin": "https://reader.example.com", "can_write": false }));
        assert_eq!(AccessController::depth(), 0);
    }

    #[test]
    fn test_target_errors_pass_through() {
        let context = ExecutionContext::root("app");
        let domain = SecurityDomain::all_permissions("https://example.com");
        let caller = caller_for(&context, &domain);

        let thrower = |_: &CallContext<'_>, _: &Value, _: &[Value]| -> Result<Value, ScriptError> {
            Err(ScriptError::thrown_at(json!({"code": 7}), "plugin.js", 3))
        };
        let cx = CallContext::new(&context, &domain);
        let err = caller.call(&thrower, &cx, &Value::Null, &[]).unwrap_err();
        assert_eq!(
            err,
            InvokeError::Script(ScriptError::thrown_at(json!({"code": 7}), "plugin.js", 3))
        );
    }
}
