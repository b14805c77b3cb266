// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Caller Cache
//!
//! Maps `(domain, context)` to a synthesized [`CachedCaller`]:
//!
//! ```text
//! WeakKeyMap<domain, DomainCallers { Mutex<WeakKeyMap<context, Slot>>, Condvar }>
//! ```
//!
//! Neither level holds its key strongly and a ready slot holds its caller
//! through a [`SoftRef`], so the cache never extends the lifetime of a domain
//! or a context.
//!
//! ## Slot state machine
//!
//! ```text
//! UNRESOLVED --claim--> SYNTHESIZING --ok--> READY
//!     ^                      |                 |
//!     +-------failure--------+                 | soft reference cleared
//!                            ^                 |
//!                            +------claim------+
//! ```
//!
//! The outer lock is held only to find or create a domain's submap. Slot
//! transitions happen under that submap's lock; the factory itself runs with
//! no lock held while the slot is `SYNTHESIZING`, and other resolvers of the
//! same pair wait on the submap's condition variable. Every waiter of a failed
//! attempt receives that attempt's error.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::domain::config::CacheConfig;
use crate::domain::error::SynthesisError;
use crate::domain::execution_context::{ContextInner, ExecutionContext};
use crate::domain::security_domain::{DomainInner, SecurityDomain};
use crate::infrastructure::trampoline::CachedCaller;
use crate::infrastructure::weak_map::{SoftRef, WeakKeyMap};

/// Observable state of one `(domain, context)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerState {
    Unresolved,
    Synthesizing,
    Ready,
    /// Ready, but the soft reference was cleared. The next resolve synthesizes again.
    Reclaimed,
}

enum SlotState {
    Unresolved,
    Synthesizing { attempt: u64 },
    Ready(SoftRef<CachedCaller>),
}

enum Poll {
    Hit(Arc<CachedCaller>),
    Wait(u64),
    Claim { attempt: u64, regenerating: bool },
}

/// Resolvers blocked on one attempt, and that attempt's error once it fails.
/// Kept until the last of them has woken, so a later attempt settling first
/// cannot hide it.
struct Waiting {
    attempt: u64,
    waiters: usize,
    failure: Option<SynthesisError>,
}

struct Slot {
    state: SlotState,
    attempt: u64,
    waiting: Vec<Waiting>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: SlotState::Unresolved,
            attempt: 0,
            waiting: Vec::new(),
        }
    }
}

impl Slot {
    fn poll(&mut self) -> Poll {
        if let SlotState::Synthesizing { attempt } = self.state {
            return Poll::Wait(attempt);
        }
        let regenerating = match &mut self.state {
            SlotState::Ready(soft) => match soft.get() {
                Some(caller) => return Poll::Hit(caller),
                None => true,
            },
            _ => false,
        };
        self.attempt += 1;
        self.state = SlotState::Synthesizing { attempt: self.attempt };
        Poll::Claim {
            attempt: self.attempt,
            regenerating,
        }
    }

    fn enlist(&mut self, attempt: u64) {
        match self.waiting.iter_mut().find(|w| w.attempt == attempt) {
            Some(waiting) => waiting.waiters += 1,
            None => self.waiting.push(Waiting {
                attempt,
                waiters: 1,
                failure: None,
            }),
        }
    }

    /// Leave the waiters of `attempt`, returning its error if it failed.
    fn dismiss(&mut self, attempt: u64) -> Option<SynthesisError> {
        let index = self.waiting.iter().position(|w| w.attempt == attempt)?;
        let waiting = &mut self.waiting[index];
        waiting.waiters -= 1;
        let failure = waiting.failure.clone();
        if waiting.waiters == 0 {
            self.waiting.swap_remove(index);
        }
        failure
    }

    fn waiters(&self) -> usize {
        self.waiting.iter().map(|w| w.waiters).sum()
    }

    fn settle_ready(&mut self, attempt: u64, caller: Arc<CachedCaller>) {
        debug_assert!(matches!(self.state, SlotState::Synthesizing { attempt: a } if a == attempt));
        self.state = SlotState::Ready(SoftRef::new(caller));
    }

    fn settle_failure(&mut self, attempt: u64, err: SynthesisError) {
        if matches!(self.state, SlotState::Synthesizing { attempt: a } if a == attempt) {
            self.state = SlotState::Unresolved;
            if let Some(waiting) = self.waiting.iter_mut().find(|w| w.attempt == attempt) {
                waiting.failure = Some(err);
            }
        }
    }

    fn observe(&self) -> CallerState {
        match &self.state {
            SlotState::Unresolved => CallerState::Unresolved,
            SlotState::Synthesizing { .. } => CallerState::Synthesizing,
            SlotState::Ready(soft) if soft.is_cleared() => CallerState::Reclaimed,
            SlotState::Ready(_) => CallerState::Ready,
        }
    }

    /// Clear a live soft reference. Returns true if one was released.
    fn reclaim(&mut self) -> bool {
        match &mut self.state {
            SlotState::Ready(soft) => soft.clear(),
            _ => false,
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        match &self.state {
            SlotState::Ready(soft) if !soft.is_cleared() => Some(soft.idle_for()),
            _ => None,
        }
    }
}

/// Submap of one domain.
struct DomainCallers {
    slots: Mutex<WeakKeyMap<ContextInner, Slot>>,
    settled: Condvar,
}

impl DomainCallers {
    fn new() -> Self {
        Self {
            slots: Mutex::new(WeakKeyMap::new()),
            settled: Condvar::new(),
        }
    }
}

struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    syntheses: AtomicU64,
    failures: AtomicU64,
    reclaimed: AtomicU64,
    record_metrics: bool,
}

impl CacheStats {
    fn new(record_metrics: bool) -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            syntheses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            record_metrics,
        }
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        if self.record_metrics {
            metrics::counter!("boundary_caller_cache_hits_total").increment(1);
        }
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if self.record_metrics {
            metrics::counter!("boundary_caller_cache_misses_total").increment(1);
        }
    }

    fn record_synthesis(&self) {
        self.syntheses.fetch_add(1, Ordering::Relaxed);
        if self.record_metrics {
            metrics::counter!("boundary_caller_cache_syntheses_total").increment(1);
        }
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if self.record_metrics {
            metrics::counter!("boundary_caller_cache_synthesis_failures_total").increment(1);
        }
    }

    fn record_reclaimed(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
        if self.record_metrics {
            metrics::counter!("boundary_caller_cache_reclaimed_total").increment(count as u64);
        }
    }

    fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            syntheses: self.syntheses.load(Ordering::Relaxed),
            synthesis_failures: self.failures.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// Factory invocations, successful or not.
    pub syntheses: u64,
    pub synthesis_failures: u64,
    pub reclaimed: u64,
}

pub struct CallerCache {
    domains: Mutex<WeakKeyMap<DomainInner, Arc<DomainCallers>>>,
    soft_reference_idle: Option<Duration>,
    stats: CacheStats,
}

impl CallerCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            domains: Mutex::new(WeakKeyMap::new()),
            soft_reference_idle: config.soft_reference_idle,
            stats: CacheStats::new(config.record_metrics),
        }
    }

    /// The caller for `(domain, context)`, running `factory` if none is cached.
    ///
    /// `factory` runs at most once per generation of the pair. Concurrent
    /// resolvers of the same pair wait for it and share its result or its
    /// error.
    pub fn resolve<F>(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
        factory: F,
    ) -> Result<Arc<CachedCaller>, SynthesisError>
    where
        F: FnOnce() -> Result<CachedCaller, SynthesisError>,
    {
        let callers = self.callers_for(domain);

        let attempt = {
            let mut slots = callers.slots.lock();
            loop {
                let slot = slots.get_or_insert_with(context.inner(), Slot::default);
                match slot.poll() {
                    Poll::Hit(caller) => {
                        trace!(
                            origin = domain.origin(),
                            context = context.name(),
                            "Caller cache hit"
                        );
                        self.stats.record_hit();
                        return Ok(caller);
                    }
                    Poll::Wait(attempt) => {
                        slot.enlist(attempt);
                        trace!(
                            origin = domain.origin(),
                            context = context.name(),
                            attempt,
                            "Waiting for caller synthesis"
                        );
                        callers.settled.wait(&mut slots);
                        let slot = slots.get_or_insert_with(context.inner(), Slot::default);
                        if let Some(err) = slot.dismiss(attempt) {
                            return Err(err);
                        }
                    }
                    Poll::Claim { attempt, regenerating } => {
                        debug!(
                            origin = domain.origin(),
                            context = context.name(),
                            attempt,
                            regenerating,
                            "Synthesizing caller"
                        );
                        self.stats.record_miss();
                        break attempt;
                    }
                }
            }
        };

        let rollback = scopeguard::guard((), |()| {
            warn!(
                origin = domain.origin(),
                context = context.name(),
                attempt,
                "Caller synthesis unwound; returning pair to unresolved"
            );
            let mut slots = callers.slots.lock();
            if let Some(slot) = slots.get_mut(context.inner()) {
                slot.settle_failure(attempt, SynthesisError::Aborted);
            }
            drop(slots);
            callers.settled.notify_all();
        });
        self.stats.record_synthesis();
        let outcome = factory();
        scopeguard::ScopeGuard::into_inner(rollback);

        let mut slots = callers.slots.lock();
        let slot = slots.get_or_insert_with(context.inner(), Slot::default);
        let result = match outcome {
            Ok(caller) => {
                let caller = Arc::new(caller);
                slot.settle_ready(attempt, Arc::clone(&caller));
                debug!(
                    origin = domain.origin(),
                    context = context.name(),
                    instance = %caller.instance_id(),
                    "Caller ready"
                );
                Ok(caller)
            }
            Err(err) => {
                warn!(
                    origin = domain.origin(),
                    context = context.name(),
                    attempt,
                    error = %err,
                    "Caller synthesis failed"
                );
                self.stats.record_failure();
                slot.settle_failure(attempt, err.clone());
                Err(err)
            }
        };
        drop(slots);
        callers.settled.notify_all();
        result
    }

    fn callers_for(&self, domain: &SecurityDomain) -> Arc<DomainCallers> {
        let mut domains = self.domains.lock();
        Arc::clone(domains.get_or_insert_with(domain.inner(), || {
            debug!(origin = domain.origin(), "First resolution for security domain");
            Arc::new(DomainCallers::new())
        }))
    }

    fn existing_callers(&self, domain: &SecurityDomain) -> Option<Arc<DomainCallers>> {
        self.domains.lock().get(domain.inner()).cloned()
    }

    fn live_callers(&self) -> Vec<Arc<DomainCallers>> {
        let mut domains = self.domains.lock();
        domains.expunge_stale();
        domains.live_values().cloned().collect()
    }

    fn with_slot<R>(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
        inspect: impl FnOnce(&mut Slot) -> R,
    ) -> Option<R> {
        let callers = self.existing_callers(domain)?;
        let mut slots = callers.slots.lock();
        let result = slots.get_mut(context.inner()).map(inspect);
        result
    }

    pub fn state(&self, domain: &SecurityDomain, context: &ExecutionContext) -> CallerState {
        self.with_slot(domain, context, |slot| slot.observe())
            .unwrap_or(CallerState::Unresolved)
    }

    /// Number of resolvers blocked on an in-flight synthesis of the pair.
    pub fn waiters(&self, domain: &SecurityDomain, context: &ExecutionContext) -> usize {
        self.with_slot(domain, context, |slot| slot.waiters())
            .unwrap_or(0)
    }

    /// Clear the cached caller of one pair, as memory pressure would.
    pub fn clear_entry(&self, domain: &SecurityDomain, context: &ExecutionContext) -> bool {
        let cleared = self.with_slot(domain, context, Slot::reclaim).unwrap_or(false);
        self.stats.record_reclaimed(usize::from(cleared));
        cleared
    }

    /// Clear every cached caller of one domain.
    pub fn clear_domain(&self, domain: &SecurityDomain) -> usize {
        let cleared = self
            .existing_callers(domain)
            .map(|callers| Self::reclaim_slots(&callers, |_| true))
            .unwrap_or(0);
        self.stats.record_reclaimed(cleared);
        cleared
    }

    /// Clear every cached caller.
    pub fn reclaim_all(&self) -> usize {
        let cleared = self
            .live_callers()
            .iter()
            .map(|callers| Self::reclaim_slots(callers, |_| true))
            .sum();
        if cleared > 0 {
            debug!(cleared, "Reclaimed all cached callers");
        }
        self.stats.record_reclaimed(cleared);
        cleared
    }

    /// Clear cached callers unused for longer than `cache.soft_reference_idle`.
    pub fn reclaim_idle(&self) -> usize {
        let Some(threshold) = self.soft_reference_idle else {
            return 0;
        };
        let cleared = self
            .live_callers()
            .iter()
            .map(|callers| {
                Self::reclaim_slots(callers, |slot| {
                    slot.idle_for().is_some_and(|idle| idle >= threshold)
                })
            })
            .sum();
        if cleared > 0 {
            debug!(cleared, ?threshold, "Reclaimed idle cached callers");
        }
        self.stats.record_reclaimed(cleared);
        cleared
    }

    fn reclaim_slots(callers: &DomainCallers, select: impl Fn(&Slot) -> bool) -> usize {
        let mut slots = callers.slots.lock();
        let released = slots
            .live_values_mut()
            .filter(|slot| select(slot))
            .map(Slot::reclaim)
            .filter(|released| *released)
            .count();
        released
    }

    /// Domains with a live submap.
    pub fn domain_count(&self) -> usize {
        self.domains.lock().len()
    }

    /// Pairs whose domain and context are both alive.
    pub fn entry_count(&self) -> usize {
        self.live_callers()
            .iter()
            .map(|callers| {
                let slots = callers.slots.lock();
                slots.len()
            })
            .sum()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }
}
