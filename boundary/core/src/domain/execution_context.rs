// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Context
//!
//! The scope synthesized callers are loaded into. Contexts form a parent
//! chain; a context created by [`crate::create_trust_boundary`] is itself
//! attributed to a [`SecurityDomain`].
//!
//! Each thread has an ambient stack of entered contexts. [`ExecutionContext::enter`]
//! pushes one for the lifetime of the returned [`ContextGuard`];
//! [`ExecutionContext::current`] reads the top, which is a checked operation
//! (`runtime.getContext`).

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use super::access::{next_scope_id, release_scoped, AccessController, FrameGuard};
use super::error::AttributionError;
use super::security_domain::{Permission, SecurityDomain};

pub(crate) struct ContextInner {
    id: Uuid,
    name: String,
    parent: Option<ExecutionContext>,
    boundary: Option<SecurityDomain>,
}

/// Handle to an execution scope. Clones share identity.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ContextInner>,
}

thread_local! {
    static AMBIENT: RefCell<Vec<(u64, ExecutionContext)>> = const { RefCell::new(Vec::new()) };
}

impl ExecutionContext {
    /// A top-level context with no parent.
    pub fn root(name: impl Into<String>) -> Self {
        Self::with_parts(name.into(), None, None)
    }

    pub fn child(&self, name: impl Into<String>) -> Self {
        Self::with_parts(name.into(), Some(self.clone()), None)
    }

    pub(crate) fn boundary_child(&self, name: String, domain: SecurityDomain) -> Self {
        Self::with_parts(name, Some(self.clone()), Some(domain))
    }

    fn with_parts(
        name: String,
        parent: Option<ExecutionContext>,
        boundary: Option<SecurityDomain>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: Uuid::new_v4(),
                name,
                parent,
                boundary,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&ExecutionContext> {
        self.inner.parent.as_ref()
    }

    /// The domain this context is a trust boundary for, if any.
    pub fn boundary_domain(&self) -> Option<&SecurityDomain> {
        self.inner.boundary.as_ref()
    }

    /// True if `ancestor` is this context or one of its parents.
    pub fn descends_from(&self, ancestor: &ExecutionContext) -> bool {
        let mut cursor = Some(self);
        while let Some(context) = cursor {
            if context == ancestor {
                return true;
            }
            cursor = context.parent();
        }
        false
    }

    /// Make this the thread's ambient context until the guard drops. Entering
    /// a trust-boundary context also attributes the thread to its domain.
    pub fn enter(&self) -> ContextGuard {
        let frame = self
            .inner
            .boundary
            .as_ref()
            .map(|domain| AccessController::enter_domain(domain.clone()));
        let id = next_scope_id();
        AMBIENT.with(|ambient| ambient.borrow_mut().push((id, self.clone())));
        ContextGuard {
            id,
            _frame: frame,
            _not_send: PhantomData,
        }
    }

    /// The thread's ambient context.
    ///
    /// # Errors
    ///
    /// - `PermissionDenied`: a domain on the frame stack lacks `runtime.getContext`
    /// - `NoActiveContext`: no context has been entered on this thread
    pub fn current() -> Result<ExecutionContext, AttributionError> {
        AccessController::check_permission(&Permission::get_context())
            .map_err(AttributionError::PermissionDenied)?;
        AMBIENT
            .with(|ambient| ambient.borrow().last().map(|(_, context)| context.clone()))
            .ok_or(AttributionError::NoActiveContext)
    }

    pub fn downgrade(&self) -> WeakExecutionContext {
        WeakExecutionContext {
            inner: Arc::downgrade(&self.inner),
            name: self.inner.name.clone(),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ExecutionContext {}

impl Hash for ExecutionContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("parent", &self.inner.parent.as_ref().map(|p| p.name()))
            .field("boundary", &self.inner.boundary.as_ref().map(|d| d.origin()))
            .finish()
    }
}

/// Non-owning reference to an [`ExecutionContext`].
#[derive(Clone, Debug)]
pub struct WeakExecutionContext {
    inner: Weak<ContextInner>,
    name: String,
}

impl WeakExecutionContext {
    pub fn upgrade(&self) -> Option<ExecutionContext> {
        self.inner.upgrade().map(|inner| ExecutionContext { inner })
    }

    pub fn is_released(&self) -> bool {
        self.inner.strong_count() == 0
    }

    /// Name of the context, still available after it is released.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Leaves the entered context when dropped.
pub struct ContextGuard {
    id: u64,
    _frame: Option<FrameGuard>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        AMBIENT.with(|ambient| {
            release_scoped(&mut *ambient.borrow_mut(), self.id, "execution context")
        });
    }
}
