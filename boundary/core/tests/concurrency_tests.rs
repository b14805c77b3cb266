// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use boundary_core::{
    ApplicationContextResolver, BoundaryConfig, BoundaryError, CachedCaller, CallContext,
    CallerState, CallerSynthesizer, ExecutionContext, InvokeError, PrivilegedInvoker, ScriptError,
    SecurityDomain, SynthesisError, TemplateSynthesizer,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Counts syntheses and sleeps before delegating to the real synthesizer.
struct SlowSynthesizer {
    runs: Arc<AtomicUsize>,
    delay: Duration,
}

impl CallerSynthesizer for SlowSynthesizer {
    fn synthesize(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
    ) -> Result<CachedCaller, SynthesisError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        TemplateSynthesizer::new("boundary/CallerImpl").synthesize(domain, context)
    }
}

/// Blocks the first synthesis of `gated_origin` until released, then fails it.
/// Later syntheses delegate to the real synthesizer.
struct GatedSynthesizer {
    gated_origin: String,
    release: Mutex<Receiver<()>>,
    runs: Arc<AtomicUsize>,
}

impl GatedSynthesizer {
    fn new(gated_origin: &str) -> (Self, Sender<()>, Arc<AtomicUsize>) {
        let (tx, rx) = channel();
        let runs = Arc::new(AtomicUsize::new(0));
        let synthesizer = Self {
            gated_origin: gated_origin.to_string(),
            release: Mutex::new(rx),
            runs: Arc::clone(&runs),
        };
        (synthesizer, tx, runs)
    }
}

impl CallerSynthesizer for GatedSynthesizer {
    fn synthesize(
        &self,
        domain: &SecurityDomain,
        context: &ExecutionContext,
    ) -> Result<CachedCaller, SynthesisError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        if domain.origin() == self.gated_origin && run == 0 {
            self.release.lock().unwrap().recv().unwrap();
            return Err(SynthesisError::Construct {
                name: "boundary/CallerImpl".to_string(),
                reason: "constructor rejected".to_string(),
            });
        }
        TemplateSynthesizer::new("boundary/CallerImpl").synthesize(domain, context)
    }
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn double(_: &CallContext<'_>, _: &Value, args: &[Value]) -> Result<Value, ScriptError> {
    Ok(json!(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
}

#[test]
fn test_concurrent_first_invokes_synthesize_once() {
    const THREADS: usize = 8;
    let context = ExecutionContext::root("engine");
    let runs = Arc::new(AtomicUsize::new(0));
    let invoker = Arc::new(
        PrivilegedInvoker::new(&BoundaryConfig::default())
            .with_resolver(ApplicationContextResolver::new(&context))
            .with_synthesizer(SlowSynthesizer {
                runs: Arc::clone(&runs),
                delay: Duration::from_millis(50),
            }),
    );
    let domain = SecurityDomain::all_permissions("https://a.example.com");
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let invoker = Arc::clone(&invoker);
            let domain = domain.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                invoker.invoke(&domain, &double, &Value::Null, &[json!(i)])
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap().unwrap(), json!(i * 2));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(invoker.cache().stats().syntheses, 1);
}

#[test]
fn test_concurrent_resolvers_share_one_instance() {
    const THREADS: usize = 6;
    let context = ExecutionContext::root("engine");
    let domain = SecurityDomain::all_permissions("https://a.example.com");
    let runs = Arc::new(AtomicUsize::new(0));
    let synthesizer = Arc::new(SlowSynthesizer {
        runs: Arc::clone(&runs),
        delay: Duration::from_millis(30),
    });
    let invoker = Arc::new(PrivilegedInvoker::new(&BoundaryConfig::default()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let invoker = Arc::clone(&invoker);
            let synthesizer = Arc::clone(&synthesizer);
            let domain = domain.clone();
            let context = context.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                invoker
                    .cache()
                    .resolve(&domain, &context, || synthesizer.synthesize(&domain, &context))
                    .unwrap()
            })
        })
        .collect();

    let callers: Vec<Arc<CachedCaller>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(callers.iter().all(|caller| Arc::ptr_eq(caller, &callers[0])));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failure_reaches_every_waiter_then_retries() {
    const WAITERS: usize = 3;
    let context = ExecutionContext::root("engine");
    let domain = SecurityDomain::all_permissions("https://a.example.com");
    let (synthesizer, release, runs) = GatedSynthesizer::new("https://a.example.com");
    let invoker = Arc::new(
        PrivilegedInvoker::new(&BoundaryConfig::default())
            .with_resolver(ApplicationContextResolver::new(&context))
            .with_synthesizer(synthesizer),
    );

    let spawn_invoke = || {
        let invoker = Arc::clone(&invoker);
        let domain = domain.clone();
        thread::spawn(move || invoker.invoke(&domain, &double, &Value::Null, &[json!(1)]))
    };

    let claimant = spawn_invoke();
    wait_until("the first caller claims synthesis", || {
        invoker.cache().state(&domain, &context) == CallerState::Synthesizing
    });
    let waiters: Vec<_> = (0..WAITERS).map(|_| spawn_invoke()).collect();
    wait_until("every waiter is blocked", || invoker.cache().waiters(&domain, &context) == WAITERS);
    release.send(()).unwrap();

    let expected = InvokeError::Boundary(BoundaryError::Synthesis {
        origin: "https://a.example.com".to_string(),
        source: SynthesisError::Construct {
            name: "boundary/CallerImpl".to_string(),
            reason: "constructor rejected".to_string(),
        },
    });
    for handle in std::iter::once(claimant).chain(waiters) {
        assert_eq!(handle.join().unwrap().unwrap_err(), expected);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(invoker.cache().state(&domain, &context), CallerState::Unresolved);
    assert_eq!(invoker.cache().waiters(&domain, &context), 0);

    assert_eq!(invoker.invoke(&domain, &double, &Value::Null, &[json!(4)]).unwrap(), json!(8));
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(invoker.cache().stats().synthesis_failures, 1);
}

#[test]
fn test_synthesis_does_not_block_other_domains() {
    let context = ExecutionContext::root("engine");
    let slow = SecurityDomain::all_permissions("https://slow.example.com");
    let fast = SecurityDomain::all_permissions("https://fast.example.com");
    let (synthesizer, release, _runs) = GatedSynthesizer::new("https://slow.example.com");
    let invoker = Arc::new(
        PrivilegedInvoker::new(&BoundaryConfig::default())
            .with_resolver(ApplicationContextResolver::new(&context))
            .with_synthesizer(synthesizer),
    );

    let blocked = {
        let invoker = Arc::clone(&invoker);
        let slow = slow.clone();
        thread::spawn(move || invoker.invoke(&slow, &double, &Value::Null, &[json!(1)]))
    };
    wait_until("the slow domain is synthesizing", || {
        invoker.cache().state(&slow, &context) == CallerState::Synthesizing
    });

    assert_eq!(invoker.invoke(&fast, &double, &Value::Null, &[json!(5)]).unwrap(), json!(10));
    assert_eq!(invoker.cache().state(&slow, &context), CallerState::Synthesizing);

    release.send(()).unwrap();
    assert!(blocked.join().unwrap().is_err());
}
