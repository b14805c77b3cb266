// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Privileged Invoker
//!
//! Entry point for running an untrusted [`Callable`] on behalf of a
//! [`SecurityDomain`]:
//!
//! 1. resolve the effective [`ExecutionContext`] (every call, never cached)
//! 2. fetch or synthesize the caller for `(domain, context)`
//! 3. run the callable through the caller, attributed to the domain
//!
//! Failures of steps 1 and 2 surface as [`BoundaryError`]; failures raised by
//! the callable come back as [`InvokeError::Script`] untouched.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::domain::access::AccessController;
use crate::domain::callable::{CallContext, Callable};
use crate::domain::config::BoundaryConfig;
use crate::domain::error::{AttributionError, BoundaryError, InvokeError, SynthesisError};
use crate::domain::execution_context::{ExecutionContext, WeakExecutionContext};
use crate::domain::security_domain::SecurityDomain;
use crate::infrastructure::loader::TrustBoundaryLoader;
use crate::infrastructure::template::caller_template;
use crate::infrastructure::trampoline::CachedCaller;

use super::caller_cache::CallerCache;

/// Source of the context a call is attributed to.
pub trait ContextResolver: Send + Sync {
    fn resolve(&self) -> Result<ExecutionContext, AttributionError>;
}

/// Resolves the context entered on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmbientContextResolver;

impl ContextResolver for AmbientContextResolver {
    fn resolve(&self) -> Result<ExecutionContext, AttributionError> {
        ExecutionContext::current()
    }
}

/// Resolves one engine-wide application context, held weakly.
#[derive(Debug, Clone)]
pub struct ApplicationContextResolver {
    context: WeakExecutionContext,
}

impl ApplicationContextResolver {
    pub fn new(context: &ExecutionContext) -> Self {
        Self {
            context: context.downgrade(),
        }
    }
}

impl ContextResolver for ApplicationContextResolver {
    fn resolve(&self) -> Result<ExecutionContext, AttributionError> {
        self.context
            .upgrade()
            .ok_or_else(|| AttributionError::ContextReleased(self.context.name().to_string()))
    }
}

/// Produces a fresh caller for one `(domain, context)` pair.
pub trait CallerSynthesizer: Send + Sync {
    fn synthesize(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
    ) -> Result<CachedCaller, SynthesisError>;
}

/// Defines, links and constructs the shared caller template in a new
/// [`TrustBoundaryLoader`] scoped to the pair.
#[derive(Debug, Clone)]
pub struct TemplateSynthesizer {
    type_name: String,
}

impl TemplateSynthesizer {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
        }
    }
}

impl CallerSynthesizer for TemplateSynthesizer {
    fn synthesize(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
    ) -> Result<CachedCaller, SynthesisError> {
        AccessController::with_system_privilege("synthesize caller", || {
            let loader = TrustBoundaryLoader::new(context, domain);
            loader.define_and_link(&self.type_name, caller_template())?.instantiate()
        })
    }
}

pub struct PrivilegedInvoker {
    cache: CallerCache,
    resolver: Box<dyn ContextResolver>,
    synthesizer: Box<dyn CallerSynthesizer>,
}

impl PrivilegedInvoker {
    /// Invoker resolving the thread's ambient context and synthesizing from
    /// the caller template.
    pub fn new(config: &BoundaryConfig) -> Self {
        Self {
            cache: CallerCache::new(&config.cache),
            resolver: Box::new(AmbientContextResolver),
            synthesizer: Box::new(TemplateSynthesizer::new(config.caller_type_name.clone())),
        }
    }

    /// Invoker configured from `path`, or from the discovered configuration
    /// file. See [`BoundaryConfig::load_or_default`].
    pub fn from_config_path(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = BoundaryConfig::load_or_default(path)?;
        debug!(
            caller_type_name = %config.caller_type_name,
            record_metrics = config.cache.record_metrics,
            "Configured privileged invoker"
        );
        Ok(Self::new(&config))
    }

    pub fn with_resolver(mut self, resolver: impl ContextResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: impl CallerSynthesizer + 'static) -> Self {
        self.synthesizer = Box::new(synthesizer);
        self
    }

    pub fn cache(&self) -> &CallerCache {
        &self.cache
    }

    /// Run `callable` with `this` and `args`, attributed to `domain`.
    ///
    /// # Errors
    ///
    /// - [`InvokeError::Boundary`]: the context could not be resolved or the
    ///   caller could not be synthesized
    /// - [`InvokeError::Script`]: whatever `callable` raised, unchanged
    pub fn invoke(
        &self,
        domain: &SecurityDomain,
        callable: &dyn Callable,
        this: &Value,
        args: &[Value],
    ) -> Result<Value, InvokeError> {
        let context =
            AccessController::with_system_privilege("resolve execution context", || {
                self.resolver.resolve()
            })
            .map_err(BoundaryError::from)?;
        trace!(
            origin = domain.origin(),
            context = context.name(),
            "Resolved effective context"
        );

        let caller = self.caller_for(domain, &context)?;

        let cx = CallContext::new(&context, domain);
        let result = caller.call(callable, &cx, this, args);
        if let Err(InvokeError::Script(err)) = &result {
            debug!(origin = domain.origin(), error = %err, "Callable raised");
        }
        result
    }

    fn caller_for(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
    ) -> Result<Arc<CachedCaller>, BoundaryError> {
        self.cache
            .resolve(domain, context, || self.synthesizer.synthesize(domain, context))
            .map_err(|source| BoundaryError::Synthesis {
                origin: domain.origin().to_string(),
                source,
            })
    }
}
