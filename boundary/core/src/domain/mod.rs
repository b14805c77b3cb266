// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Trust Boundary Domain Model
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`security_domain`] | `SecurityDomain` identity, `Grant` and `Permission` value objects |
//! | [`execution_context`] | `ExecutionContext` scopes and the thread's ambient context stack |
//! | [`access`] | `AccessController` frame stack and permission checks |
//! | [`callable`] | `Callable` contract, `CallContext`, `ScriptError` |
//! | [`error`] | Boundary error taxonomy |
//! | [`config`] | `BoundaryConfig` loading and validation |
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Types shared by the loader infrastructure and the invoker

pub mod access;
pub mod callable;
pub mod config;
pub mod error;
pub mod execution_context;
pub mod security_domain;

pub use access::AccessController;
pub use callable::{CallContext, Callable, ScriptError};
pub use config::{BoundaryConfig, CacheConfig};
pub use error::{AccessViolation, AttributionError, BoundaryError, InvokeError, SynthesisError};
pub use execution_context::{ContextGuard, ExecutionContext, WeakExecutionContext};
pub use security_domain::{
    Grant, Permission, SecurityDomain, SecurityDomainBuilder, WeakSecurityDomain,
};
