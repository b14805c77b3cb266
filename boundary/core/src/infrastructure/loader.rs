// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Trust Boundary Loader
//!
//! Defines code blobs as types scoped to a [`SecurityDomain`] below a parent
//! [`ExecutionContext`]. This is the only place a domain is bound to
//! executable code.
//!
//! A loaded type refers to its domain and defining context weakly, so a
//! cached instance never keeps either alive.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Implements the module-loading collaborator of the caller cache

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;

use crate::domain::access::AccessController;
use crate::domain::error::{AccessViolation, SynthesisError};
use crate::domain::execution_context::{ExecutionContext, WeakExecutionContext};
use crate::domain::security_domain::{Permission, SecurityDomain, WeakSecurityDomain};

use super::template::{
    self, CodeBlob, Instruction, TypeDescriptor, CALLER_SUPERTYPE, CONSTRUCTOR_NAME,
};
use super::trampoline::CachedCaller;

/// Defines and links generated types.
pub trait GeneratedLoader: Send + Sync {
    /// Define a new type from `blob`. Types defined through one loader must
    /// have distinct names.
    fn define_type(&self, name: &str, blob: &CodeBlob) -> Result<Arc<LoadedType>, SynthesisError>;

    /// Link a type returned by [`GeneratedLoader::define_type`]. Idempotent.
    fn link_type(&self, loaded: &LoadedType) -> Result<(), SynthesisError>;
}

/// A defined caller type.
pub struct LoadedType {
    name: String,
    descriptor: TypeDescriptor,
    domain: WeakSecurityDomain,
    origin: String,
    defining_context: WeakExecutionContext,
    loader_id: Uuid,
    call_code: OnceLock<Arc<[Instruction]>>,
}

impl LoadedType {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Origin of the domain the type is attributed to.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn domain(&self) -> Option<SecurityDomain> {
        self.domain.upgrade()
    }

    pub fn defining_context(&self) -> Option<ExecutionContext> {
        self.defining_context.upgrade()
    }

    pub fn is_linked(&self) -> bool {
        self.call_code.get().is_some()
    }

    pub(crate) fn weak_domain(&self) -> &WeakSecurityDomain {
        &self.domain
    }

    pub(crate) fn call_code(&self) -> Option<&Arc<[Instruction]>> {
        self.call_code.get()
    }

    /// Run the zero-argument constructor.
    pub fn instantiate(self: &Arc<Self>) -> Result<CachedCaller, SynthesisError> {
        let construct_error = |reason: String| SynthesisError::Construct {
            name: self.name.clone(),
            reason,
        };

        if !self.is_linked() {
            return Err(construct_error("type has not been linked".to_string()));
        }
        let constructor = self
            .descriptor
            .method(CONSTRUCTOR_NAME)
            .ok_or_else(|| construct_error("no constructor".to_string()))?;

        let mut stack_depth = 0usize;
        for instruction in &constructor.code {
            match instruction {
                Instruction::LoadLocal(0) => stack_depth += 1,
                Instruction::InvokeSuper { name, .. }
                    if name == CONSTRUCTOR_NAME && stack_depth == 1 =>
                {
                    // The base caller constructor has no state to initialize.
                    stack_depth -= 1;
                }
                Instruction::Return if stack_depth == 0 => {
                    return Ok(CachedCaller::new(Arc::clone(self)));
                }
                other => {
                    return Err(construct_error(format!(
                        "unexpected constructor instruction {other:?}"
                    )));
                }
            }
        }
        Err(construct_error("constructor does not return".to_string()))
    }
}

impl fmt::Debug for LoadedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedType")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("defining_context", &self.defining_context.name())
            .field("linked", &self.is_linked())
            .finish()
    }
}

/// Loader bound to one domain below one parent context.
pub struct TrustBoundaryLoader {
    id: Uuid,
    parent: WeakExecutionContext,
    domain: WeakSecurityDomain,
    origin: String,
    defined: Mutex<HashMap<String, Arc<LoadedType>>>,
}

impl TrustBoundaryLoader {
    pub fn new(parent: &ExecutionContext, domain: &SecurityDomain) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent: parent.downgrade(),
            domain: domain.downgrade(),
            origin: domain.origin().to_string(),
            defined: Mutex::new(HashMap::new()),
        }
    }

    /// Define then link, back to back.
    pub fn define_and_link(
        &self,
        name: &str,
        blob: &CodeBlob,
    ) -> Result<Arc<LoadedType>, SynthesisError> {
        let loaded = self.define_type(name, blob)?;
        self.link_type(&loaded)?;
        Ok(loaded)
    }

    pub fn defined_count(&self) -> usize {
        self.defined.lock().len()
    }
}

impl GeneratedLoader for TrustBoundaryLoader {
    fn define_type(&self, name: &str, blob: &CodeBlob) -> Result<Arc<LoadedType>, SynthesisError> {
        let define_error = |reason: String| SynthesisError::Define {
            name: name.to_string(),
            reason,
        };

        if self.domain.is_released() {
            return Err(define_error(format!("domain '{}' has been released", self.origin)));
        }

        let mut defined = self.defined.lock();
        if defined.contains_key(name) {
            return Err(define_error("duplicate type definition in this loader".to_string()));
        }

        let descriptor = template::decode(blob).map_err(|e| define_error(e.to_string()))?;
        if descriptor.supertype != CALLER_SUPERTYPE {
            return Err(define_error(format!(
                "supertype '{}' is not visible to this loader",
                descriptor.supertype
            )));
        }

        let loaded = Arc::new(LoadedType {
            name: name.to_string(),
            descriptor,
            domain: self.domain.clone(),
            origin: self.origin.clone(),
            defining_context: self.parent.clone(),
            loader_id: self.id,
            call_code: OnceLock::new(),
        });
        defined.insert(name.to_string(), Arc::clone(&loaded));
        debug!(name, origin = %self.origin, context = self.parent.name(), "Defined caller type");
        Ok(loaded)
    }

    fn link_type(&self, loaded: &LoadedType) -> Result<(), SynthesisError> {
        let link_error = |reason: String| SynthesisError::Link {
            name: loaded.name.clone(),
            reason,
        };

        if loaded.loader_id != self.id {
            return Err(link_error("type was defined by a different loader".to_string()));
        }
        if loaded.is_linked() {
            return Ok(());
        }
        if self.parent.is_released() {
            return Err(link_error(format!(
                "defining context '{}' has been released",
                self.parent.name()
            )));
        }
        if self.domain.is_released() {
            return Err(link_error(format!("domain '{}' has been released", self.origin)));
        }

        template::verify(&loaded.descriptor).map_err(|e| link_error(e.to_string()))?;
        let call = loaded
            .descriptor
            .method(template::CALL_METHOD_NAME)
            .ok_or_else(|| link_error("no call method".to_string()))?;
        let _ = loaded.call_code.set(Arc::from(call.code.as_slice()));
        Ok(())
    }
}

/// Create a context below `parent` that is a trust boundary for `domain`.
/// Code run while the returned context is entered is attributed to `domain`.
pub fn create_trust_boundary(
    parent: &ExecutionContext,
    domain: &SecurityDomain,
) -> Result<ExecutionContext, AccessViolation> {
    AccessController::with_elevated_privilege("create trust boundary", || {
        AccessController::check_permission(&Permission::create_boundary())?;
        let name = format!("{}@{}", parent.name(), domain.origin());
        let boundary = parent.boundary_child(name, domain.clone());
        debug!(parent = parent.name(), origin = domain.origin(), "Created trust boundary context");
        Ok(boundary)
    })
}
