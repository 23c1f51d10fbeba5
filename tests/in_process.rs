use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use testvisor::{
    DisposalTracker, ExecutionContext, LineReporterSink, MessageKind, RunnerConfig,
    TestCaseDescriptor, TestCaseFn, TestCaseRef, TestContext, TestError, TestRunner, wire,
};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn config(max: usize) -> RunnerConfig {
    RunnerConfig {
        max_concurrency: max,
        ..RunnerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reported_lines_decode_into_one_bracketed_run() {
    let out = SharedBuf::default();
    let cases: Vec<TestCaseRef> = (0..6)
        .map(|i| -> TestCaseRef {
            TestCaseFn::arc(
                TestCaseDescriptor::new(format!("suite.case{i}"), format!("case {i}"))
                    .with_method("suite", format!("case{i}")),
                move |_: &TestContext| {
                    if i == 4 {
                        Err(TestError::failed("bad value"))
                    } else {
                        Ok(())
                    }
                },
            )
        })
        .collect();

    let summary = TestRunner::new(config(3))
        .with_assembly("asm", "/tmp/suite.bin")
        .run(cases, LineReporterSink::new(out.clone()))
        .await
        .unwrap();
    assert_eq!(summary.totals.total, 6);
    assert_eq!(summary.totals.failed, 1);

    let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    let messages: Vec<_> = text.lines().map(|l| wire::from_line(l).unwrap()).collect();

    let starts = messages
        .iter()
        .filter(|m| m.kind == MessageKind::AssemblyStarting)
        .count();
    assert_eq!(starts, 1);
    assert_eq!(messages[0].kind, MessageKind::AssemblyStarting);

    let last = messages.last().unwrap();
    assert_eq!(last.kind, MessageKind::AssemblyFinished);
    assert_eq!(last.totals, Some(summary.totals));

    let passed = messages
        .iter()
        .filter(|m| m.kind == MessageKind::TestPassed)
        .count();
    assert_eq!(passed, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn context_and_detached_work_flow_into_tests() {
    let observed = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(AtomicUsize::new(0));

    let probe = Arc::clone(&observed);
    let done = Arc::clone(&finished);
    let case: TestCaseRef = TestCaseFn::arc(
        TestCaseDescriptor::new("ctx", "ctx"),
        move |ctx: &TestContext| {
            let probe = Arc::clone(&probe);
            let done = Arc::clone(&done);
            ExecutionContext::capture().with_culture("fr-FR").run(|| {
                ctx.post(move || {
                    std::thread::sleep(Duration::from_millis(20));
                    probe
                        .lock()
                        .unwrap()
                        .push(ExecutionContext::capture().culture().map(str::to_owned));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            });
            Ok(())
        },
    );

    let summary = TestRunner::new(config(2))
        .run(vec![case], testvisor::NullSink)
        .await
        .unwrap();

    assert!(summary.is_success());
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(*observed.lock().unwrap(), vec![Some("fr-FR".to_string())]);
}

#[tokio::test]
async fn disposal_tracker_releases_in_reverse_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let tracker = DisposalTracker::new();

    for name in ["bus", "dispatcher", "process"] {
        let order = Arc::clone(&order);
        tracker
            .add_action(move || {
                order.lock().unwrap().push(name);
                Ok(())
            })
            .unwrap();
    }
    tracker.dispose().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["process", "dispatcher", "bus"]);
}
