//! Lifecycle tests for `keel_flow`: asynchronous operations, readiness,
//! per-invocation configuration, latch timeouts, shutdown and tokio-backed
//! teams.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use keel_flow::config::OfficeConfig;
use keel_flow::error::{FlowError, InvokeError};
use keel_flow::function::{AsyncOperation, FlowOptions, FunctionContext};
use keel_flow::office::{Office, OfficeBuilder};
use keel_flow::team::TokioTeam;
use keel_system::context::{ProcessConfig, ProcessConfigError};
use keel_system::error::{Escalation, Message, ResourceError};
use keel_system::resource::{Object, ResourceBinding, ResourceIndex, ResourceInstance, ResourceScope};
use keel_system::source::{CompletionHandle, ResourceSource, SourceContext, Sourced, source_fn};
use parking_lot::Mutex;
use tokio::runtime::Handle;

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

/// A source that never completes on its own.
#[derive(Clone, Default)]
struct Stalled {
    handle: Arc<Mutex<Option<CompletionHandle>>>,
}

impl ResourceSource for Stalled {
    fn source(&self, ctx: &SourceContext<'_>) -> Result<Sourced, Escalation> {
        *self.handle.lock() = Some(ctx.completion());
        Ok(Sourced::Pending)
    }
}

fn stalled_office(config: OfficeConfig) -> (Office, Stalled) {
    let stalled = Stalled::default();
    let mut builder = OfficeBuilder::new().with_config(config);
    let slow = builder
        .bind(ResourceBinding::new("slow", ResourceScope::Process).with_instance(ResourceInstance::new(stalled.clone())))
        .unwrap();
    builder
        .function("wait", |_: &mut FunctionContext<'_>| -> Result<(), Escalation> { Ok(()) })
        .uses(slow);
    (builder.build().unwrap(), stalled)
}

/// A source whose object is only usable while its gate is open.
#[derive(Clone, Default)]
struct Gated {
    open: Arc<AtomicBool>,
    handle: Arc<Mutex<Option<CompletionHandle>>>,
}

impl ResourceSource for Gated {
    fn source(&self, _ctx: &SourceContext<'_>) -> Result<Sourced, Escalation> {
        Ok(Sourced::ready(7_u32))
    }

    fn is_ready(&self, _object: &Object, ctx: &SourceContext<'_>) -> bool {
        *self.handle.lock() = Some(ctx.completion());
        self.open.load(Ordering::SeqCst)
    }
}

impl Gated {
    fn completion(&self) -> CompletionHandle {
        self.handle.lock().clone().expect("readiness checked")
    }
}

/// One function using a gated resource bound in `scope`; counts its runs.
fn gated_office(scope: ResourceScope) -> (Office, Gated, Arc<AtomicUsize>) {
    let gated = Gated::default();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut builder = OfficeBuilder::new();
    let gate = builder
        .bind(ResourceBinding::new("gate", scope).with_instance(ResourceInstance::new(gated.clone())))
        .unwrap();
    {
        let runs = Arc::clone(&runs);
        builder
            .function("use", move |ctx: &mut FunctionContext<'_>| -> Result<(), Escalation> {
                assert_eq!(*ctx.object::<u32>(gate)?, 7);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .uses(gate);
    }
    (builder.build().unwrap(), gated, runs)
}

/// A two-instance resource, an input and a function recording what it read.
fn configured_office() -> (Office, ResourceIndex, ResourceIndex, Arc<Mutex<Vec<(u32, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut builder = OfficeBuilder::new();
    let request = builder
        .bind(ResourceBinding::new("request", ResourceScope::Process).input())
        .unwrap();
    let cache = builder
        .bind(
            ResourceBinding::new("cache", ResourceScope::Process)
                .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(1_u32)))))
                .with_instance(ResourceInstance::new(source_fn(|_| Ok(Sourced::ready(2_u32))))),
        )
        .unwrap();
    {
        let seen = Arc::clone(&seen);
        builder
            .function("read", move |ctx: &mut FunctionContext<'_>| -> Result<(), Escalation> {
                let cache = *ctx.object::<u32>(cache)?;
                let request = ctx.object::<String>(request)?;
                seen.lock().push((cache, request.as_str().to_owned()));
                Ok(())
            })
            .uses(request)
            .uses(cache);
    }
    (builder.build().unwrap(), request, cache, seen)
}

/// Starts `count` operations and hands them to the test.
fn async_office(count: usize) -> (Office, Arc<Mutex<Vec<AsyncOperation>>>, Arc<AtomicUsize>) {
    let operations = Arc::new(Mutex::new(Vec::new()));
    let after = Arc::new(AtomicUsize::new(0));
    let mut builder = OfficeBuilder::new();
    {
        let operations = Arc::clone(&operations);
        builder
            .function("start", move |ctx: &mut FunctionContext<'_>| -> Result<(), Escalation> {
                let mut operations = operations.lock();
                for _ in 0..count {
                    operations.push(ctx.start_async());
                }
                Ok(())
            })
            .next("after");
    }
    {
        let after = Arc::clone(&after);
        builder.function("after", move |_: &mut FunctionContext<'_>| -> Result<(), Escalation> {
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    (builder.build().unwrap(), operations, after)
}

// ─────────────────────────────────────────────────────────────────────────────
// Asynchronous operations
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn function_completes_once_every_operation_settles() {
    let (office, operations, after) = async_office(2);
    let handle = office.invoke("start").unwrap();

    let mut pending: Vec<_> = operations.lock().drain(..).collect();
    assert_eq!(pending.len(), 2);
    assert!(handle.try_outcome().is_none());

    pending.pop().unwrap().complete();
    assert!(handle.try_outcome().is_none());
    assert_eq!(after.load(Ordering::SeqCst), 0);

    let last = pending.pop().unwrap();
    thread::spawn(move || last.complete()).join().unwrap();

    assert!(handle.wait().is_completed());
    assert_eq!(after.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_operation_escalates_from_its_function() {
    let (office, operations, after) = async_office(1);
    let handle = office.invoke("start").unwrap();

    let operation = operations.lock().pop().unwrap();
    operation.fail(Escalation::new(Message("upload rejected".into())));

    let outcome = handle.wait();
    assert_eq!(
        outcome.failure().map(ToString::to_string).as_deref(),
        Some("upload rejected")
    );
    assert_eq!(after.load(Ordering::SeqCst), 0);
}

#[test]
fn dropped_operation_fails_its_function() {
    let (office, operations, _after) = async_office(1);
    let handle = office.invoke("start").unwrap();

    drop(operations.lock().pop());

    let outcome = handle.wait();
    let cause = outcome.failure().expect("process failed");
    assert!(matches!(
        cause.downcast_ref::<FlowError>(),
        Some(FlowError::AsyncDropped { function }) if function == "start"
    ));
}

/// An operation completed while its function is still running releases the
/// function as soon as it starts waiting.
#[test]
fn operation_completed_inside_the_function_does_not_block() {
    let mut builder = OfficeBuilder::new();
    builder.function("eager", |ctx: &mut FunctionContext<'_>| -> Result<(), Escalation> {
        ctx.start_async().complete();
        Ok(())
    });
    let office = builder.build().unwrap();

    let outcome = office
        .invoke("eager")
        .unwrap()
        .wait_timeout(Duration::from_secs(5))
        .expect("process finished");
    assert!(outcome.is_completed());
}

// ─────────────────────────────────────────────────────────────────────────────
// Readiness
// ─────────────────────────────────────────────────────────────────────────────

const SCOPES: [ResourceScope; 3] = [ResourceScope::Process, ResourceScope::Thread, ResourceScope::Function];

/// A function stays suspended until its resource reports ready, however
/// often it is notified, and then runs exactly once.
#[test]
fn function_waits_until_its_resource_is_ready() {
    for scope in SCOPES {
        let (office, gated, runs) = gated_office(scope);
        let handle = office.invoke("use").unwrap();
        assert!(handle.try_outcome().is_none(), "{scope:?}");

        gated.completion().notify_ready();
        assert!(handle.try_outcome().is_none(), "{scope:?}");
        assert_eq!(runs.load(Ordering::SeqCst), 0, "{scope:?}");

        gated.open.store(true, Ordering::SeqCst);
        gated.completion().notify_ready();

        let outcome = handle.wait_timeout(Duration::from_secs(5)).expect("process settled");
        assert!(outcome.is_completed(), "{scope:?}");
        assert_eq!(runs.load(Ordering::SeqCst), 1, "{scope:?}");

        gated.completion().notify_ready();
        assert_eq!(runs.load(Ordering::SeqCst), 1, "{scope:?}");
    }
}

#[test]
fn resource_that_will_never_be_ready_fails_the_process() {
    for scope in SCOPES {
        let (office, gated, runs) = gated_office(scope);
        let handle = office.invoke("use").unwrap();
        assert!(handle.try_outcome().is_none(), "{scope:?}");

        gated.completion().notify_failed(Escalation::msg("never"));

        let outcome = handle.wait_timeout(Duration::from_secs(5)).expect("process settled");
        assert_eq!(
            outcome.failure().map(ToString::to_string).as_deref(),
            Some("never"),
            "{scope:?}"
        );
        assert_eq!(runs.load(Ordering::SeqCst), 0, "{scope:?}");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process configuration
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn selected_instance_and_input_reach_the_function() {
    let (office, request, cache, seen) = configured_office();

    let config = ProcessConfig::new().with_input(request, String::from("GET /"));
    assert!(office.invoke_process("read", None, config).unwrap().wait().is_completed());

    let config = ProcessConfig::new()
        .with_input(request, String::from("GET /cached"))
        .with_instance(cache, 1);
    assert!(office.invoke_process("read", None, config).unwrap().wait().is_completed());

    assert_eq!(
        *seen.lock(),
        vec![(1, "GET /".to_owned()), (2, "GET /cached".to_owned())]
    );
}

#[test]
fn invalid_configurations_are_refused_at_invocation() {
    let (office, request, cache, seen) = configured_office();

    let out_of_range = ProcessConfig::new().with_input(request, String::new()).with_instance(cache, 5);
    assert_eq!(
        office.invoke_process("read", None, out_of_range).unwrap_err(),
        InvokeError::Config(ProcessConfigError::InvalidInstance {
            name: "cache".into(),
            instance: 5,
            available: 2,
        })
    );

    let sourced_as_input = ProcessConfig::new().with_input(cache, 3_u32);
    assert_eq!(
        office.invoke_process("read", None, sourced_as_input).unwrap_err(),
        InvokeError::Config(ProcessConfigError::NotInput("cache".into()))
    );

    let unbound = ResourceIndex::new(ResourceScope::Function, 9);
    let unknown = ProcessConfig::new().with_instance(unbound, 0);
    assert_eq!(
        office.invoke_process("read", None, unknown).unwrap_err(),
        InvokeError::Config(ProcessConfigError::UnknownResource(unbound))
    );

    assert!(seen.lock().is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Timeouts and shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn stale_waiters_time_out() {
    let (office, _stalled) = stalled_office(OfficeConfig::default().with_latch_timeout(Duration::from_millis(50)));
    let handle = office.invoke("wait").unwrap();
    assert!(handle.try_outcome().is_none());

    assert_eq!(office.check_timeouts_at(Instant::now()), 1);
    assert!(handle.try_outcome().is_none());

    office.check_timeouts_at(Instant::now() + Duration::from_secs(1));

    let outcome = handle.wait();
    let cause = outcome.failure().expect("process failed");
    assert!(matches!(
        cause.downcast_ref::<ResourceError>(),
        Some(ResourceError::Timeout { name, .. }) if name == "slow"
    ));
    assert_eq!(office.check_timeouts(), 0);
}

#[test]
fn late_completion_after_timeout_is_ignored() {
    let (office, stalled) = stalled_office(OfficeConfig::default().with_latch_timeout(Duration::from_millis(1)));
    let handle = office.invoke("wait").unwrap();
    office.check_timeouts_at(Instant::now() + Duration::from_secs(1));
    assert!(!handle.wait().is_completed());

    if let Some(completion) = stalled.handle.lock().take() {
        completion.complete_with(1_u8);
    }
    assert!(!handle.wait().is_completed());
}

#[test]
fn closing_the_office_fails_waiters_and_refuses_new_processes() {
    let (office, _stalled) = stalled_office(OfficeConfig::default());
    let handle = office.invoke("wait").unwrap();

    office.close();

    let outcome = handle.wait();
    let cause = outcome.failure().expect("process failed");
    assert!(matches!(
        cause.downcast_ref::<ResourceError>(),
        Some(ResourceError::ShuttingDown(_))
    ));
    assert!(office.is_closed());
    assert_eq!(office.invoke("wait").unwrap_err(), InvokeError::Closed);
}

/// Every invocation racing `close` is either refused or settled by the
/// shutdown; none is left waiting.
#[test]
fn invocations_racing_close_are_refused_or_settled() {
    const INVOKERS: usize = 4;

    let (office, _stalled) = stalled_office(OfficeConfig::default());
    let office = Arc::new(office);
    let start = Arc::new(std::sync::Barrier::new(INVOKERS + 1));

    let invokers: Vec<_> = (0..INVOKERS)
        .map(|_| {
            let office = Arc::clone(&office);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut handles = Vec::new();
                loop {
                    match office.invoke("wait") {
                        Ok(handle) => handles.push(handle),
                        Err(error) => {
                            assert_eq!(error, InvokeError::Closed);
                            return handles;
                        }
                    }
                }
            })
        })
        .collect();

    start.wait();
    thread::sleep(Duration::from_millis(10));
    office.close();

    for invoker in invokers {
        for handle in invoker.join().unwrap() {
            let outcome = handle.wait_timeout(Duration::from_secs(5)).expect("process settled");
            let cause = outcome.failure().expect("process failed");
            assert!(matches!(
                cause.downcast_ref::<ResourceError>(),
                Some(ResourceError::ShuttingDown(_))
            ));
        }
    }
}

#[test]
fn missing_input_fails_the_process() {
    let mut builder = OfficeBuilder::new();
    let request: ResourceIndex = builder
        .bind(ResourceBinding::new("request", ResourceScope::Process).input())
        .unwrap();
    builder
        .function("serve", |_: &mut FunctionContext<'_>| -> Result<(), Escalation> { Ok(()) })
        .uses(request);
    let office = builder.build().unwrap();

    let outcome = office.invoke("serve").unwrap().wait();
    let cause = outcome.failure().expect("process failed");
    assert!(matches!(
        cause.downcast_ref::<ResourceError>(),
        Some(ResourceError::InputMissing(name)) if name == "request"
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Teams
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processes_run_on_tokio_teams() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut builder = OfficeBuilder::new().with_config(OfficeConfig::default().with_default_team("workers"));
    builder.team("workers", TokioTeam::from_handle("workers", Handle::current()));
    builder
        .function("fan_out", |ctx: &mut FunctionContext<'_>| -> Result<(), Escalation> {
            for _ in 0..8 {
                ctx.do_flow("leaf", None, FlowOptions::new().spawn_thread().with_callback(|_| Ok(())))?;
            }
            Ok(())
        })
        .next("leaf");
    {
        let runs = Arc::clone(&runs);
        builder.function("leaf", move |_: &mut FunctionContext<'_>| -> Result<(), Escalation> {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
    let office = builder.build().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), office.invoke("fan_out").unwrap().completion())
        .await
        .expect("process finished");

    assert!(outcome.is_completed());
    assert_eq!(runs.load(Ordering::SeqCst), 9);
}

/// Functions pinned to different teams hand the chain back and forth.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chains_cross_teams() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let io = TokioTeam::new("io", 1).unwrap();
    let mut builder = OfficeBuilder::new();
    builder.team("io", io);
    builder.team("main", TokioTeam::from_handle("main", Handle::current()));
    for (name, team, next) in [("read", "io", Some("parse")), ("parse", "main", Some("write")), ("write", "io", None)] {
        let seen = Arc::clone(&seen);
        let function = builder
            .function(name, move |_: &mut FunctionContext<'_>| -> Result<(), Escalation> {
                let worker = thread::current().name().unwrap_or_default().to_owned();
                seen.lock().push((name, worker));
                Ok(())
            })
            .team(team);
        if let Some(next) = next {
            function.next(next);
        }
    }
    let office = builder.build().unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), office.invoke("read").unwrap().completion())
        .await
        .expect("process finished");

    assert!(outcome.is_completed());
    let seen = seen.lock();
    assert_eq!(seen.iter().map(|(name, _)| *name).collect::<Vec<_>>(), vec!["read", "parse", "write"]);
    assert!(seen[0].1.starts_with("io-worker"));
    assert!(seen[2].1.starts_with("io-worker"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn timeout_monitor_fails_stale_waiters() {
    let config = OfficeConfig::default()
        .with_latch_timeout(Duration::from_millis(20))
        .with_timeout_check_interval(Duration::from_millis(5));
    let (office, _stalled) = stalled_office(config);
    let monitor = office.spawn_timeout_monitor(&Handle::current());

    let outcome = tokio::time::timeout(Duration::from_secs(5), office.invoke("wait").unwrap().completion())
        .await
        .expect("timed out by the monitor");
    assert!(matches!(
        outcome.failure().and_then(|cause| cause.downcast_ref::<ResourceError>()),
        Some(ResourceError::Timeout { .. })
    ));

    office.close();
    tokio::time::timeout(Duration::from_secs(5), monitor)
        .await
        .expect("monitor stops")
        .unwrap();
}
