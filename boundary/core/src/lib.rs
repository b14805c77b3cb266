// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Trust boundary for embedded script callables.
//!
//! Host applications run untrusted callables through a [`PrivilegedInvoker`].
//! Every call executes on a frame attributed to a [`SecurityDomain`], so any
//! [`AccessController::check_permission`] performed by the callable sees the
//! domain's grants rather than the host's.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Wires the domain model, the caller template and loader
//!   infrastructure, and the caching invoker together

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::caller_cache::{CacheStatsSnapshot, CallerCache, CallerState};
pub use application::invoker::{
    AmbientContextResolver, ApplicationContextResolver, CallerSynthesizer, ContextResolver,
    PrivilegedInvoker, TemplateSynthesizer,
};
pub use domain::*;
pub use infrastructure::loader::{
    create_trust_boundary, GeneratedLoader, LoadedType, TrustBoundaryLoader,
};
pub use infrastructure::trampoline::CachedCaller;
