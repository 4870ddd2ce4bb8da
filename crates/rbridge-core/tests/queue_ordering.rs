//! Integration tests for command queue ordering and exclusivity.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use common::Harness;
use rbridge_core::{EngineValue, Error, PendingResult};

// =============================================================================
// Test Helpers
// =============================================================================

/// Registers `step(i)`: asserts `i` is the next expected position and that no
/// other call is inside the engine at the same time.
struct StepRecorder {
    next: Arc<AtomicUsize>,
    inside: Arc<AtomicBool>,
    overlaps: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<i32>>>,
}

impl StepRecorder {
    fn install(h: &Harness, strict: bool) -> Self {
        let steps = Self {
            next: Arc::new(AtomicUsize::new(1)),
            inside: Arc::new(AtomicBool::new(false)),
            overlaps: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(Mutex::new(Vec::new())),
        };
        let next = steps.next.clone();
        let inside = steps.inside.clone();
        let overlaps = steps.overlaps.clone();
        let order = steps.order.clone();
        h.engine.register_function("step", move |args: &[EngineValue]| {
            if inside.swap(true, Ordering::SeqCst) {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            let position = match args.first() {
                Some(EngineValue::Integer(v)) if v.len() == 1 => v[0],
                other => panic!("step() needs one integer, got {:?}", other),
            };
            thread::sleep(Duration::from_millis(5));
            let expected = next.fetch_add(1, Ordering::SeqCst) as i32;
            order.lock().unwrap().push(position);
            inside.store(false, Ordering::SeqCst);
            if strict && position != expected {
                return Err(Error::Engine(format!(
                    "step {} ran at position {}",
                    position, expected
                )));
            }
            Ok(EngineValue::Integer(vec![position]))
        });
        steps
    }

    fn order(&self) -> Vec<i32> {
        self.order.lock().unwrap().clone()
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_fifo_across_submitting_threads() {
    let h = Harness::new();
    let steps = StepRecorder::install(&h, true);
    assert!(h.controller.is_available());

    // Hold the engine busy so all three entries are queued before any runs.
    let blocker = h.controller.command_queue().submit("Sys.sleep(0.2)", false);

    let (tx, rx) = mpsc::channel::<PendingResult>();
    for position in 1..=3 {
        let controller = h.controller.clone();
        let tx = tx.clone();
        thread::spawn(move || {
            let pending = controller
                .command_queue()
                .submit(format!("step({}L)", position), false);
            tx.send(pending).expect("send pending result");
        })
        .join()
        .expect("submitter thread");
    }
    drop(tx);

    blocker.wait().expect("blocker");
    let results: Vec<_> = rx.iter().map(|p| p.wait()).collect();
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(
            result.expect("step succeeded"),
            EngineValue::Integer(vec![i as i32 + 1])
        );
    }
    assert_eq!(steps.order(), vec![1, 2, 3]);
}

#[test]
fn test_queued_scripts_never_overlap() {
    let h = Harness::new();
    let steps = StepRecorder::install(&h, false);
    assert!(h.controller.is_available());

    let threads = 4;
    let per_thread = 5;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let controller = h.controller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let pending: Vec<_> = (0..per_thread)
                    .map(|i| {
                        let position = (t * per_thread + i) as i32;
                        controller
                            .command_queue()
                            .submit(format!("step({}L)", position), false)
                    })
                    .collect();
                pending
                    .into_iter()
                    .map(|p| p.wait().expect("step succeeded"))
                    .count()
            })
        })
        .collect();

    let done: usize = handles
        .into_iter()
        .map(|h| h.join().expect("submitter thread"))
        .sum();
    assert_eq!(done, threads * per_thread);
    assert_eq!(steps.overlaps.load(Ordering::SeqCst), 0);

    // Each thread's own submissions keep their relative order.
    let order = steps.order();
    for t in 0..threads as i32 {
        let mine: Vec<_> = order
            .iter()
            .copied()
            .filter(|p| p / per_thread as i32 == t)
            .collect();
        let mut sorted = mine.clone();
        sorted.sort();
        assert_eq!(mine, sorted);
    }
}

#[test]
fn test_failed_entry_does_not_stop_queue() {
    let h = Harness::new();
    let queue = h.controller.command_queue();
    let bad = queue.submit("stop(\"broken script\")", true);
    let good = queue.submit("x <- 41L + 1L", true);

    let err = bad.wait().expect_err("script fails");
    assert!(matches!(err, Error::Engine(_)));
    assert_eq!(good.wait().expect("script runs"), EngineValue::Integer(vec![42]));

    let text = h.controller.console().text();
    assert!(text.contains("> stop(\"broken script\")"));
    assert!(text.contains("broken script"));
    assert!(text.contains("> x <- 41L + 1L"));
}

#[test]
fn test_direct_output_is_not_attributed_to_queued_command() {
    let h = Harness::new();
    h.controller.eval("print(\"direct\")").expect("eval");
    h.controller
        .command_queue()
        .submit("print(\"queued\")", true)
        .wait()
        .expect("script runs");

    let text = h.controller.console().text();
    assert!(text.contains("[1] \"queued\""));
    assert!(!text.contains("direct"));
}

#[test]
fn test_failed_script_leaves_engine_usable() {
    let h = Harness::new();
    let queue = h.controller.command_queue();
    let err = queue
        .submit("x <- 1:Inf", false)
        .wait()
        .expect_err("sequence too long");
    assert!(err.to_string().contains("result would be too long a vector"));

    assert_eq!(
        queue.submit("y <- 1L", false).wait().expect("queued script runs"),
        EngineValue::Integer(vec![1])
    );
    assert_eq!(
        h.controller.eval("z <- 2L").expect("direct eval runs"),
        EngineValue::Integer(vec![2])
    );
}

#[test]
fn test_queue_on_unavailable_engine_settles_with_error() {
    let h = Harness::with_config(|config| rbridge_core::ControllerConfig {
        home: config.home.map(|home| home.join("missing")),
        ..config
    });
    let result = h
        .controller
        .command_queue()
        .submit("1", true)
        .wait_timeout(Duration::from_secs(5))
        .expect("settled");
    assert!(matches!(result, Err(Error::EngineUnavailable(_))));
}

#[test]
fn test_stop_and_restart_consumer() {
    let h = Harness::new();
    let queue = h.controller.command_queue();
    queue.stop();
    assert!(!queue.is_running());

    let pending = queue.submit("y <- 1", false);
    assert!(pending.wait_timeout(Duration::from_millis(50)).is_none());

    h.controller.start_queue().expect("restart");
    assert!(matches!(h.controller.start_queue(), Err(Error::Queue(_))));
    assert!(pending.wait_timeout(Duration::from_secs(5)).expect("settled").is_ok());
}
