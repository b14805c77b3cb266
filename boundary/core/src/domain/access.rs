// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Access Controller
//!
//! Ambient permission checking. Each thread carries a stack of frames:
//!
//! - a **domain frame** is pushed for as long as code attributed to a
//!   [`SecurityDomain`] runs (a cached caller's `call`, or host code inside an
//!   entered trust-boundary context);
//! - a **privileged frame** is pushed for the duration of one elevated
//!   operation.
//!
//! [`AccessController::check_permission`] walks the stack from the top. Every
//! domain frame must imply the permission. A privileged frame ends the walk
//! after checking the domain that requested the elevation, so elevation never
//! grants an untrusted domain more than it already has. An empty stack is
//! host code and is fully trusted.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use tracing::{error, trace};

use super::error::AccessViolation;
use super::security_domain::{Permission, SecurityDomain};

enum Frame {
    Domain(SecurityDomain),
    Privileged {
        scope: &'static str,
        on_behalf_of: Option<SecurityDomain>,
    },
}

thread_local! {
    static FRAMES: RefCell<Vec<(u64, Frame)>> = const { RefCell::new(Vec::new()) };
    static NEXT_SCOPE_ID: Cell<u64> = const { Cell::new(0) };
}

/// Id for an entry of one of this thread's scoped stacks.
pub(super) fn next_scope_id() -> u64 {
    NEXT_SCOPE_ID.with(|next| {
        let id = next.get();
        next.set(id + 1);
        id
    })
}

/// Remove the entry `id` from a scoped stack. Only that entry is removed, so
/// a guard dropped out of order never releases the entries above it.
pub(super) fn release_scoped<T>(stack: &mut Vec<(u64, T)>, id: u64, kind: &'static str) {
    match stack.iter().rposition(|(entry, _)| *entry == id) {
        Some(index) => {
            if index + 1 != stack.len() {
                error!(
                    kind,
                    position = index,
                    depth = stack.len(),
                    "Scope released out of order; entries above it stay active"
                );
            }
            stack.remove(index);
        }
        None => error!(kind, id, "Scope released twice"),
    }
}

/// Removes the frame it pushed when dropped.
pub(crate) struct FrameGuard {
    id: u64,
    _not_send: PhantomData<*const ()>,
}

impl FrameGuard {
    fn push(frame: Frame) -> Self {
        let id = next_scope_id();
        FRAMES.with(|frames| frames.borrow_mut().push((id, frame)));
        Self {
            id,
            _not_send: PhantomData,
        }
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| release_scoped(&mut *frames.borrow_mut(), self.id, "access frame"));
    }
}

pub struct AccessController;

impl AccessController {
    /// Check `permission` against every domain on the current frame stack.
    pub fn check_permission(permission: &Permission) -> Result<(), AccessViolation> {
        FRAMES.with(|frames| {
            for (_, frame) in frames.borrow().iter().rev() {
                match frame {
                    Frame::Domain(domain) => domain.implies(permission)?,
                    Frame::Privileged { scope, on_behalf_of } => {
                        if let Some(domain) = on_behalf_of {
                            domain.implies(permission)?;
                        }
                        trace!(scope, %permission, "Permission check stopped at privileged frame");
                        return Ok(());
                    }
                }
            }
            Ok(())
        })
    }

    /// The domain of the top-most attributed frame, if any.
    pub fn current_domain() -> Option<SecurityDomain> {
        FRAMES.with(|frames| {
            frames.borrow().iter().rev().find_map(|(_, frame)| match frame {
                Frame::Domain(domain) => Some(domain.clone()),
                Frame::Privileged { .. } => None,
            })
        })
    }

    /// Number of frames on this thread's stack.
    pub fn depth() -> usize {
        FRAMES.with(|frames| frames.borrow().len())
    }

    /// Run exactly one operation elevated. Checks inside `operation` stop at
    /// this frame after consulting the domain that requested the elevation,
    /// so untrusted code gains nothing it was not already granted.
    pub fn with_elevated_privilege<R>(scope: &'static str, operation: impl FnOnce() -> R) -> R {
        let requester = Self::current_domain();
        let _frame = FrameGuard::push(Frame::Privileged {
            scope,
            on_behalf_of: requester,
        });
        operation()
    }

    /// Elevation requested by the boundary itself, which is trusted.
    pub(crate) fn with_system_privilege<R>(
        scope: &'static str,
        operation: impl FnOnce() -> R,
    ) -> R {
        let _frame = FrameGuard::push(Frame::Privileged {
            scope,
            on_behalf_of: None,
        });
        operation()
    }

    /// Attribute the current thread to `domain` until the guard drops.
    pub(crate) fn enter_domain(domain: SecurityDomain) -> FrameGuard {
        FrameGuard::push(Frame::Domain(domain))
    }
}
