//! # In-process test runner.
//!
//! [`TestRunner`] executes a set of [`TestCase`]s on a [`BoundedDispatcher`]
//! and reports every step through a message bus.
//!
//! ## Event flow
//! ```text
//! run(cases, sink)
//!   ├─► order cases (fallback: random order + ErrorMessage)
//!   ├─► AssemblyStarting
//!   ├─► for each case (at most N in flight):
//!   │     worker thread:  TestCaseStarting ─► TestStarting ─► body
//!   │     runtime task:   wait tracker ─► Passed|Failed|Skipped|NotRun
//!   │                                   ─► TestFinished ─► TestCaseFinished
//!   ├─► join all case tasks
//!   ├─► AssemblyFinished (totals)
//!   └─► dispose dispatcher, dispose bus (final drain)
//! ```
//!
//! ## Rules
//! - A worker is held only while the body runs; detached work is awaited off-thread.
//! - A case finishes after its tracker reports no outstanding operations.
//!   The first detached failure fails a case whose body passed.
//! - Scheduling stops once the bus latch says stop, the run is cancelled,
//!   or (with `stop_on_fail`) a case fails. Unscheduled cases are counted
//!   as not run and produce no messages.
//! - Messages of one case are queued in order; cases interleave freely.
//! - A panic anywhere on the worker, reporting included, fails the case
//!   and still frees its slot.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::case::{TestCaseRef, TestContext};
use crate::cases::{DefaultTestCaseOrderer, TestCaseDescriptor, TestCaseOrderer, order_test_cases};
use crate::config::RunnerConfig;
use crate::dispatch::{AsyncOperationTracker, BoundedDispatcher};
use crate::error::{RunnerError, TestError};
use crate::messages::{
    Bus, ErrorMetadata, Message, MessageBus, MessageKind, RunTotals, SynchronousMessageBus,
};
use crate::sinks::MessageSink;

/// Result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Totals as reported in `AssemblyFinished`.
    pub totals: RunTotals,
    /// Whether scheduling stopped before every case was started.
    pub stopped_early: bool,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// Whether no case failed.
    pub fn is_success(&self) -> bool {
        self.totals.failed == 0
    }
}

/// Runs test cases in-process.
///
/// ## Example
/// ```rust,no_run
/// use testvisor::{
///     NullSink, RunnerConfig, TestCaseDescriptor, TestCaseFn, TestCaseRef, TestRunner,
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let cases: Vec<TestCaseRef> = vec![TestCaseFn::arc(
///         TestCaseDescriptor::new("demo.ok", "ok"),
///         |_ctx| Ok(()),
///     )];
///
///     let summary = TestRunner::new(RunnerConfig::default())
///         .run(cases, NullSink)
///         .await?;
///     assert_eq!(summary.totals.total, 1);
///     Ok(())
/// }
/// ```
pub struct TestRunner {
    config: RunnerConfig,
    orderer: Arc<dyn TestCaseOrderer>,
    assembly_id: Arc<str>,
    assembly_path: Arc<str>,
    cancel: CancellationToken,
}

impl TestRunner {
    /// Runner with the default orderer and a placeholder assembly identity.
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            orderer: Arc::new(DefaultTestCaseOrderer),
            assembly_id: Arc::from("assembly"),
            assembly_path: Arc::from(""),
            cancel: CancellationToken::new(),
        }
    }

    /// Replaces the case orderer.
    pub fn with_orderer(mut self, orderer: Arc<dyn TestCaseOrderer>) -> Self {
        self.orderer = orderer;
        self
    }

    /// Sets the assembly identity reported in the run bracket.
    pub fn with_assembly(mut self, unique_id: impl Into<Arc<str>>, path: impl Into<Arc<str>>) -> Self {
        self.assembly_id = unique_id.into();
        self.assembly_path = path.into();
        self
    }

    /// Token that stops scheduling when cancelled; also visible to test bodies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs `cases`, reporting to `sink`, and returns once every started case
    /// finished and the bus drained.
    pub async fn run(
        &self,
        cases: Vec<TestCaseRef>,
        sink: impl MessageSink,
    ) -> Result<RunSummary, RunnerError> {
        let started = Instant::now();
        let bus: Arc<dyn Bus> = if self.config.synchronous_message_reporting {
            Arc::new(SynchronousMessageBus::new(sink))
        } else {
            Arc::new(MessageBus::new(sink, self.config.stop_on_fail)?)
        };
        let dispatcher = match BoundedDispatcher::new(self.config.concurrency_limit()) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                let _ = bus.dispose();
                return Err(e);
            }
        };

        let state = Arc::new(RunState {
            bus: Arc::clone(&bus),
            assembly_id: Arc::clone(&self.assembly_id),
            stop_on_fail: self.config.stop_on_fail,
            continue_running: Arc::new(AtomicBool::new(true)),
            totals: Mutex::new(RunTotals::default()),
            cancel: self.cancel.clone(),
        });

        let ordered = order_test_cases(self.orderer.as_ref(), cases, |c| c.descriptor());
        state.queue(
            Message::new(MessageKind::AssemblyStarting)
                .with_paths(Arc::clone(&self.assembly_path), None),
        );
        if let Some(e) = ordered.error {
            state.queue(Message::error_message(ErrorMetadata::single(
                "TestCaseOrderingFailure",
                e.as_message(),
                None,
            )));
        }

        let slots = Arc::new(Semaphore::new(dispatcher.max_concurrency()));
        let runtime = tokio::runtime::Handle::current();
        let mut in_flight = JoinSet::new();
        let mut unscheduled = 0u32;

        for case in ordered.cases {
            if state.should_stop() {
                unscheduled += 1;
                continue;
            }
            let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
                unscheduled += 1;
                continue;
            };
            if state.should_stop() {
                unscheduled += 1;
                continue;
            }

            let (done_tx, done_rx) = oneshot::channel();
            let ctx = TestContext {
                descriptor: case.descriptor().clone(),
                assembly_id: Arc::clone(&self.assembly_id),
                test_id: Arc::from(format!("{}-0", case.descriptor().unique_id)),
                tracker: AsyncOperationTracker::with_dispatcher(dispatcher.handle()),
                runtime: runtime.clone(),
                cancel: self.cancel.clone(),
                bus: Arc::clone(&bus),
                continue_running: Arc::clone(&state.continue_running),
            };
            let tracker = ctx.tracker.clone();
            let descriptor = ctx.descriptor.clone();
            let test_id = Arc::clone(&ctx.test_id);

            let worker_state = Arc::clone(&state);
            dispatcher.post(move || {
                let run = AssertUnwindSafe(|| execute(&worker_state, case, &ctx));
                let outcome = catch_unwind(run)
                    .unwrap_or_else(|p| (Err(TestError::from_panic(&*p)), Duration::ZERO));
                drop(slot);
                let _ = done_tx.send(outcome);
            });

            let state = Arc::clone(&state);
            in_flight.spawn(async move {
                let (outcome, elapsed) = done_rx.await.unwrap_or_else(|_| {
                    (
                        Err(TestError::Panicked {
                            message: "test worker dropped the case".into(),
                        }),
                        Duration::ZERO,
                    )
                });
                let late = tracker.wait_for_completion().await;
                let outcome = match (outcome, late) {
                    (Ok(()), Some(e)) => Err(e),
                    (outcome, _) => outcome,
                };
                state.finish(&descriptor, &test_id, outcome, elapsed);
            });
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(target: "testvisor::runner", error = %e, "case reporter task failed");
            }
        }

        let totals = {
            let mut totals = state.lock_totals();
            totals.total += unscheduled;
            totals.not_run += unscheduled;
            totals.time_ms = started.elapsed().as_millis() as u64;
            *totals
        };
        state.queue(Message::new(MessageKind::AssemblyFinished).with_totals(totals));

        let disposed = tokio::task::spawn_blocking(move || {
            let workers = dispatcher.dispose();
            let delivery = bus.dispose();
            workers.and(delivery)
        })
        .await
        .map_err(|e| RunnerError::Io(std::io::Error::other(e)))?;
        disposed?;

        tracing::debug!(
            target: "testvisor::runner",
            total = totals.total,
            failed = totals.failed,
            skipped = totals.skipped,
            not_run = totals.not_run,
            "run finished"
        );
        Ok(RunSummary {
            totals,
            stopped_early: unscheduled > 0,
            elapsed: started.elapsed(),
        })
    }
}

/// Worker-thread half of a case: start messages and the body.
fn execute(
    state: &RunState,
    case: TestCaseRef,
    ctx: &TestContext,
) -> (Result<(), TestError>, Duration) {
    state.queue(state.scoped(MessageKind::TestCaseStarting, &ctx.descriptor, None));
    state.queue(state.scoped(MessageKind::TestStarting, &ctx.descriptor, Some(&ctx.test_id)));

    if let Some(reason) = &ctx.descriptor.skip_reason {
        return (
            Err(TestError::Skipped {
                reason: reason.clone(),
            }),
            Duration::ZERO,
        );
    }
    if ctx.is_cancelled() {
        return (Err(TestError::Canceled), Duration::ZERO);
    }

    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| case.run(ctx)))
        .unwrap_or_else(|p| Err(TestError::from_panic(&*p)));
    (outcome, started.elapsed())
}

struct RunState {
    bus: Arc<dyn Bus>,
    assembly_id: Arc<str>,
    stop_on_fail: bool,
    continue_running: Arc<AtomicBool>,
    totals: Mutex<RunTotals>,
    cancel: CancellationToken,
}

impl RunState {
    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || !self.continue_running.load(Ordering::Acquire)
    }

    fn queue(&self, message: Message) {
        let message = message.with_assembly(Arc::clone(&self.assembly_id));
        match self.bus.queue_message(message) {
            Ok(true) => {}
            Ok(false) => self.continue_running.store(false, Ordering::Release),
            Err(e) => {
                tracing::warn!(target: "testvisor::runner", error = %e, "message dropped");
                self.continue_running.store(false, Ordering::Release);
            }
        }
    }

    fn scoped(&self, kind: MessageKind, descriptor: &TestCaseDescriptor, test_id: Option<&Arc<str>>) -> Message {
        let mut message = Message::new(kind)
            .with_test_case(descriptor.unique_id.as_str())
            .with_display_name(descriptor.display_name.as_str());
        if let Some(class) = &descriptor.class_name {
            message = message.with_class(class.as_str());
        }
        if let Some(method) = &descriptor.method_name {
            message = message.with_method(method.as_str());
        }
        if let Some(test_id) = test_id {
            message = message.with_test(Arc::clone(test_id));
        }
        message
    }

    /// Runtime half of a case: outcome, totals and closing messages.
    fn finish(
        &self,
        descriptor: &TestCaseDescriptor,
        test_id: &Arc<str>,
        outcome: Result<(), TestError>,
        elapsed: Duration,
    ) {
        let result = {
            let mut totals = self.lock_totals();
            totals.total += 1;
            let base = self.scoped(MessageKind::TestPassed, descriptor, Some(test_id));
            match outcome {
                Ok(()) => base,
                Err(TestError::Skipped { reason }) => {
                    totals.skipped += 1;
                    Message {
                        kind: MessageKind::TestSkipped,
                        ..base
                    }
                    .with_text(reason)
                }
                Err(TestError::Canceled) => {
                    totals.not_run += 1;
                    Message {
                        kind: MessageKind::TestNotRun,
                        ..base
                    }
                }
                Err(e) => {
                    totals.failed += 1;
                    tracing::debug!(target: "testvisor::runner", case = %descriptor.unique_id, error = %e, "test failed");
                    Message {
                        kind: MessageKind::TestFailed,
                        ..base
                    }
                    .with_error(ErrorMetadata::from_test_error(&e))
                }
            }
        };
        if self.stop_on_fail && result.kind == MessageKind::TestFailed {
            self.continue_running.store(false, Ordering::Release);
        }

        self.queue(result.with_execution_time(elapsed));
        self.queue(
            self.scoped(MessageKind::TestFinished, descriptor, Some(test_id))
                .with_execution_time(elapsed),
        );
        self.queue(self.scoped(MessageKind::TestCaseFinished, descriptor, None));
    }

    fn lock_totals(&self) -> std::sync::MutexGuard<'_, RunTotals> {
        self.totals.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TestCaseFn;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Message>>);

    impl MessageSink for Recorder {
        fn on_message(&self, message: &Message) -> bool {
            self.0.lock().unwrap().push(message.clone());
            true
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<MessageKind> {
            self.0.lock().unwrap().iter().map(|m| m.kind).collect()
        }

        fn for_case(&self, id: &str) -> Vec<MessageKind> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|m| m.test_case_unique_id.as_deref() == Some(id))
                .map(|m| m.kind)
                .collect()
        }
    }

    fn config(max: usize) -> RunnerConfig {
        RunnerConfig {
            max_concurrency: max,
            ..RunnerConfig::default()
        }
    }

    fn case<F>(id: &str, f: F) -> TestCaseRef
    where
        F: Fn(&TestContext) -> Result<(), TestError> + Send + Sync + 'static,
    {
        TestCaseFn::arc(TestCaseDescriptor::new(id, id), f)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn brackets_the_run_and_reports_each_outcome() {
        let sink = Arc::new(Recorder::default());
        let cases = vec![
            case("pass", |_| Ok(())),
            case("fail", |_| Err(TestError::failed("nope"))),
            case("panic", |_| panic!("boom")),
            TestCaseFn::arc(
                TestCaseDescriptor::new("skip", "skip").with_skip("later"),
                |_: &TestContext| -> Result<(), TestError> { panic!("skipped bodies never run") },
            ),
        ];

        let summary = TestRunner::new(config(2))
            .run(cases, Arc::clone(&sink))
            .await
            .unwrap();

        assert_eq!(summary.totals.total, 4);
        assert_eq!(summary.totals.failed, 2);
        assert_eq!(summary.totals.skipped, 1);
        assert_eq!(summary.totals.passed(), 1);
        assert!(!summary.stopped_early);

        let kinds = sink.kinds();
        assert_eq!(kinds.first(), Some(&MessageKind::AssemblyStarting));
        assert_eq!(kinds.last(), Some(&MessageKind::AssemblyFinished));
        assert_eq!(
            sink.for_case("pass"),
            vec![
                MessageKind::TestCaseStarting,
                MessageKind::TestStarting,
                MessageKind::TestPassed,
                MessageKind::TestFinished,
                MessageKind::TestCaseFinished,
            ]
        );
        assert!(sink.for_case("panic").contains(&MessageKind::TestFailed));
        assert!(sink.for_case("skip").contains(&MessageKind::TestSkipped));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_runs_more_bodies_than_the_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cases = (0..10)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                case(&format!("c{i}"), move |_| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let summary = TestRunner::new(config(3)).run(cases, NullRecorder).await.unwrap();
        assert_eq!(summary.totals.total, 10);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    struct NullRecorder;

    impl MessageSink for NullRecorder {
        fn on_message(&self, _: &Message) -> bool {
            true
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn detached_failure_fails_a_passing_body() {
        let sink = Arc::new(Recorder::default());
        let cases = vec![case("detached", |ctx| {
            ctx.spawn(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err(TestError::failed("late"))
            });
            Ok(())
        })];

        let summary = TestRunner::new(config(1))
            .run(cases, Arc::clone(&sink))
            .await
            .unwrap();
        assert_eq!(summary.totals.failed, 1);

        let messages = sink.0.lock().unwrap();
        let failed = messages
            .iter()
            .find(|m| m.kind == MessageKind::TestFailed)
            .unwrap();
        assert_eq!(failed.error.as_ref().and_then(|e| e.root_message()), Some("late"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_on_fail_leaves_later_cases_unscheduled() {
        let cfg = RunnerConfig {
            max_concurrency: 1,
            stop_on_fail: true,
            ..RunnerConfig::default()
        };
        let cases = (0..5)
            .map(|i| case(&format!("f{i}"), |_| Err(TestError::failed("x"))))
            .collect();

        let summary = TestRunner::new(cfg).run(cases, NullRecorder).await.unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.totals.total, 5);
        assert!(summary.totals.failed >= 1);
        assert_eq!(summary.totals.failed + summary.totals.not_run, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_run_schedules_nothing() {
        let runner = TestRunner::new(config(2));
        runner.cancellation_token().cancel();
        let sink = Arc::new(Recorder::default());

        let summary = runner
            .run(vec![case("a", |_| Ok(())), case("b", |_| Ok(()))], Arc::clone(&sink))
            .await
            .unwrap();
        assert_eq!(summary.totals.not_run, 2);
        assert_eq!(
            sink.kinds(),
            vec![MessageKind::AssemblyStarting, MessageKind::AssemblyFinished]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_orderer_still_runs_everything() {
        struct Broken;
        impl TestCaseOrderer for Broken {
            fn order(&self, _: &[&TestCaseDescriptor]) -> Result<Vec<usize>, RunnerError> {
                Err(RunnerError::OrderingFailed {
                    reason: "broken".into(),
                })
            }
        }

        let sink = Arc::new(Recorder::default());
        let summary = TestRunner::new(config(2))
            .with_orderer(Arc::new(Broken))
            .run(vec![case("a", |_| Ok(())), case("b", |_| Ok(()))], Arc::clone(&sink))
            .await
            .unwrap();
        assert_eq!(summary.totals.passed(), 2);
        assert!(sink.kinds().contains(&MessageKind::ErrorMessage));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn synchronous_reporting_delivers_inline() {
        let cfg = RunnerConfig {
            synchronous_message_reporting: true,
            ..config(1)
        };
        let sink = Arc::new(Recorder::default());
        let summary = TestRunner::new(cfg)
            .with_assembly("asm-1", "/tmp/asm")
            .run(
                vec![case("out", |ctx| {
                    ctx.output("hello");
                    Ok(())
                })],
                Arc::clone(&sink),
            )
            .await
            .unwrap();
        assert!(summary.is_success());

        let messages = sink.0.lock().unwrap();
        assert!(messages
            .iter()
            .all(|m| m.assembly_unique_id.as_deref() == Some("asm-1")));
        assert!(messages
            .iter()
            .any(|m| m.kind == MessageKind::TestOutput && m.text.as_deref() == Some("hello")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sink_panic_under_synchronous_reporting_completes_the_run() {
        struct PanicsOnStart;
        impl MessageSink for PanicsOnStart {
            fn on_message(&self, message: &Message) -> bool {
                if message.kind == MessageKind::TestCaseStarting {
                    panic!("reporter exploded");
                }
                true
            }
        }

        let cfg = RunnerConfig {
            synchronous_message_reporting: true,
            ..config(1)
        };
        let cases = vec![case("a", |_| Ok(())), case("b", |_| Ok(()))];

        let summary = tokio::time::timeout(
            Duration::from_secs(5),
            TestRunner::new(cfg).run(cases, PanicsOnStart),
        )
        .await
        .expect("run must not hang")
        .unwrap();
        assert_eq!(summary.totals.total, 2);
        assert!(!summary.stopped_early);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_refused_by_the_sink_stops_scheduling() {
        struct RefusesOutput(Recorder);
        impl MessageSink for RefusesOutput {
            fn on_message(&self, message: &Message) -> bool {
                self.0.on_message(message);
                message.kind != MessageKind::TestOutput
            }
        }

        let cfg = RunnerConfig {
            synchronous_message_reporting: true,
            ..config(1)
        };
        let cases = vec![
            case("talks", |ctx| {
                ctx.output("enough");
                Ok(())
            }),
            case("later-1", |_| Ok(())),
            case("later-2", |_| Ok(())),
        ];

        let sink = Arc::new(RefusesOutput(Recorder::default()));
        let summary = TestRunner::new(cfg)
            .with_orderer(Arc::new(InputOrder))
            .run(cases, Arc::clone(&sink))
            .await
            .unwrap();
        assert!(summary.stopped_early);
        assert_eq!(summary.totals.total, 3);
        assert_eq!(summary.totals.not_run, 2);
        assert!(sink.0.for_case("later-1").is_empty());
        assert!(sink.0.for_case("later-2").is_empty());
    }

    struct InputOrder;

    impl TestCaseOrderer for InputOrder {
        fn order(&self, cases: &[&TestCaseDescriptor]) -> Result<Vec<usize>, RunnerError> {
            Ok((0..cases.len()).collect())
        }
    }
}
