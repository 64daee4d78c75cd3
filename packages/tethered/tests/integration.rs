//! Integration tests for the tethered event loop bridge.
//!
//! These tests drive a real event loop thread through the Tokio reactor. They are ignored under
//! Miri because Miri does not support the Tokio runtime.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use testing::{LogCapture, with_watchdog};
use tethered::{Error, EventLoop, Failure, ResultStore};
use thiserror::Error as ThisError;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, ThisError)]
#[error("division by zero")]
struct DivideByZero;

fn divide(numerator: u32, denominator: u32) -> Result<u32, DivideByZero> {
    numerator.checked_div(denominator).ok_or(DivideByZero)
}

fn started_loop() -> EventLoop {
    let event_loop = EventLoop::builder()
        .result_store(Arc::new(ResultStore::new()))
        .build();
    event_loop.start().unwrap();
    event_loop
}

#[cfg_attr(miri, ignore)]
#[test]
fn run_returns_value_repeatedly() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let result = event_loop.run(|| Ok::<_, Infallible>(2 + 3)).unwrap();

        assert_eq!(result.wait(TIMEOUT).unwrap(), 5);
        assert_eq!(result.wait(TIMEOUT).unwrap(), 5);

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn run_surfaces_original_error() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let result = event_loop.run(|| divide(1, 0)).unwrap();

        for _ in 0..2 {
            let error = result.wait(TIMEOUT).unwrap_err();
            assert!(error.as_failure().unwrap().is::<DivideByZero>());
        }

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn work_runs_on_loop_thread() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let name = event_loop
            .wait_for(
                || Ok::<_, Infallible>(thread::current().name().map(str::to_string)),
                TIMEOUT,
            )
            .unwrap();

        assert_eq!(name.as_deref(), Some("tethered-loop"));

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn panicking_work_does_not_stop_loop() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let failed = event_loop.wait_for(
            || -> Result<u32, Infallible> { panic!("work exploded") },
            TIMEOUT,
        );
        let error = failed.unwrap_err();
        assert!(error.as_failure().unwrap().is_panic());

        assert_eq!(
            event_loop
                .wait_for(|| Ok::<_, Infallible>(1), TIMEOUT)
                .unwrap(),
            1
        );

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn timeout_then_later_result() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let (result, resolver) = event_loop.pending::<&str>().unwrap();

        let started = Instant::now();
        assert!(matches!(
            result.wait(Duration::from_millis(50)),
            Err(Error::TimedOut)
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));

        event_loop
            .run(move || {
                resolver.succeed("value");
                Ok::<_, Infallible>(())
            })
            .unwrap();

        assert_eq!(result.wait(TIMEOUT).unwrap(), "value");

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shutdown_unblocks_waiting_threads() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let (result, _resolver) = event_loop.pending::<u32>().unwrap();

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let result = result.clone();
                thread::spawn(move || result.wait_unbounded())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        event_loop.shutdown();

        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap(), Err(Error::LoopStopped)));
        }

        assert!(event_loop.registry().is_stopped());
        assert!(matches!(
            event_loop.run(|| Ok::<_, Infallible>(1)),
            Err(Error::RegistryClosed)
        ));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shutdown_fails_in_flight_async_work() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let result = event_loop
            .run_async(async || {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, Infallible>(1)
            })
            .unwrap();

        event_loop.shutdown();

        assert!(matches!(result.wait(TIMEOUT), Err(Error::LoopStopped)));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn stash_and_retrieve_once() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let first = event_loop
            .run(|| Ok::<_, Infallible>(10_u32))
            .unwrap()
            .stash()
            .unwrap();
        let second = event_loop
            .run(|| Ok::<_, Infallible>(20_u32))
            .unwrap()
            .stash()
            .unwrap();
        assert!(second > first);

        let result = event_loop.retrieve::<u32>(first).unwrap();
        assert_eq!(result.wait(TIMEOUT).unwrap(), 10);

        assert!(matches!(
            event_loop.retrieve::<u32>(first),
            Err(Error::UnknownHandle { .. })
        ));

        // The handle can be redeemed from any thread.
        let store = Arc::clone(event_loop.result_store());
        let value = thread::spawn(move || store.retrieve::<u32>(second).unwrap().wait(TIMEOUT))
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(value, 20);

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn default_loops_keep_stashed_results_apart() {
    with_watchdog(|| {
        let first_loop = EventLoop::new();
        let second_loop = EventLoop::new();
        first_loop.start().unwrap();
        second_loop.start().unwrap();

        let (result, resolver) = first_loop.pending::<u32>().unwrap();
        let handle = result.stash().unwrap();
        drop(result);

        second_loop.shutdown();

        let retrieved = first_loop.retrieve::<u32>(handle).unwrap();
        resolver.succeed(5);
        assert_eq!(retrieved.wait(TIMEOUT).unwrap(), 5);

        first_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shared_store_is_swept_per_loop() {
    with_watchdog(|| {
        let capture = LogCapture::new();
        let store = Arc::new(ResultStore::new());
        let loop_with_store = || {
            let event_loop = EventLoop::builder()
                .result_store(Arc::clone(&store))
                .build();
            event_loop.start().unwrap();
            event_loop
        };

        let first_loop = loop_with_store();
        let second_loop = loop_with_store();

        let first = first_loop.run(|| divide(4, 0)).unwrap();
        let second = second_loop.run(|| divide(4, 0)).unwrap();
        let first_handle = first.stash().unwrap();
        let second_handle = second.stash().unwrap();

        // Both failures are in place before either loop shuts down.
        first_loop
            .wait_for(|| Ok::<_, Infallible>(()), TIMEOUT)
            .unwrap();
        second_loop
            .wait_for(|| Ok::<_, Infallible>(()), TIMEOUT)
            .unwrap();
        drop(first);
        drop(second);

        capture.run(|| second_loop.shutdown());

        assert_eq!(capture.error_count(), 1);
        assert!(matches!(
            store.retrieve::<u32>(second_handle),
            Err(Error::UnknownHandle { .. })
        ));

        let kept = store.retrieve::<u32>(first_handle).unwrap();
        let error = kept.wait(TIMEOUT).unwrap_err();
        assert!(error.as_failure().unwrap().is::<DivideByZero>());

        first_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn store_is_freed_once_all_owners_are_gone() {
    let store = Arc::new(ResultStore::new());
    let weak_store = Arc::downgrade(&store);

    let event_loop = EventLoop::builder().result_store(store).build();
    event_loop.start_passive().unwrap();

    let (result, resolver) = event_loop.pending::<u32>().unwrap();
    result.stash().unwrap();

    drop(result);
    drop(resolver);
    drop(event_loop);

    assert!(weak_store.upgrade().is_none());
}

#[cfg_attr(miri, ignore)]
#[test]
fn async_work_is_driven_on_loop() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let value = event_loop
            .wait_for_async(
                async || {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, Infallible>("slept")
                },
                TIMEOUT,
            )
            .unwrap();

        assert_eq!(value, "slept");

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn async_work_chains_on_other_pending_work() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let (value_tx, value_rx) = futures::channel::oneshot::channel::<u32>();

        let result = event_loop
            .run_async(async move || {
                let value = value_rx.await.map_err(Failure::new)?;
                Ok::<_, Failure>(u64::from(value))
            })
            .unwrap();

        assert!(matches!(
            result.wait(Duration::from_millis(20)),
            Err(Error::TimedOut)
        ));

        event_loop
            .run(move || {
                value_tx.send(42).map_err(|_unsent| Failure::msg("receiver gone"))
            })
            .unwrap();

        assert_eq!(result.wait(TIMEOUT).unwrap(), 42);

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_aborts_async_work() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let finished = Arc::new(AtomicBool::new(false));

        let finished_clone = Arc::clone(&finished);
        let result = event_loop
            .run_async(async move || {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished_clone.store(true, Ordering::Relaxed);
                Ok::<_, Infallible>(1)
            })
            .unwrap();

        result.cancel();
        result.cancel();

        assert!(matches!(result.wait(TIMEOUT), Err(Error::Cancelled)));
        assert!(!finished.load(Ordering::Relaxed));

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn cancel_after_result_changes_nothing() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let result = event_loop.run(|| Ok::<_, Infallible>(3)).unwrap();
        assert_eq!(result.wait(TIMEOUT).unwrap(), 3);

        result.cancel();

        // Anything scheduled after the cancellation runs after it, too.
        event_loop
            .wait_for(|| Ok::<_, Infallible>(()), TIMEOUT)
            .unwrap();
        assert_eq!(result.wait(TIMEOUT).unwrap(), 3);

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn wait_for_timeout_cancels_work() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let finished = Arc::new(AtomicBool::new(false));

        let finished_clone = Arc::clone(&finished);
        let outcome = event_loop.wait_for_async(
            async move || {
                tokio::time::sleep(Duration::from_millis(300)).await;
                finished_clone.store(true, Ordering::Relaxed);
                Ok::<_, Infallible>(1)
            },
            Duration::from_millis(20),
        );
        assert!(matches!(outcome, Err(Error::TimedOut)));

        thread::sleep(Duration::from_millis(500));
        assert!(!finished.load(Ordering::Relaxed));

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn waiting_on_loop_thread_is_rejected() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let (other, _resolver) = event_loop.pending::<u32>().unwrap();

        let rejected = event_loop
            .wait_for(
                move || {
                    Ok::<_, Infallible>(matches!(
                        other.wait(Duration::from_secs(1)),
                        Err(Error::WaitOnLoopThread)
                    ))
                },
                TIMEOUT,
            )
            .unwrap();

        assert!(rejected);

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn run_with_reactor_sees_loop_thread() {
    with_watchdog(|| {
        let event_loop = started_loop();

        let on_loop = event_loop
            .run_with_reactor(|reactor| Ok::<_, Infallible>(reactor.is_loop_thread()))
            .unwrap();

        assert!(on_loop.wait(TIMEOUT).unwrap());
        assert!(!event_loop.reactor().is_loop_thread());

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn start_transitions() {
    with_watchdog(|| {
        let event_loop = started_loop();

        event_loop.start().unwrap();
        assert!(matches!(
            event_loop.start_passive(),
            Err(Error::AlreadyStarted)
        ));

        event_loop.shutdown();
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn exit_hooks_run_before_loop_stops() {
    with_watchdog(|| {
        let event_loop = started_loop();
        let registry_stopped_in_hook = Arc::new(Mutex::new(None));

        let registry = Arc::clone(event_loop.registry());
        let observed = Arc::clone(&registry_stopped_in_hook);
        event_loop.register_exit_hook(move || {
            *observed.lock() = Some(registry.is_stopped());
        });

        event_loop.shutdown();

        assert_eq!(*registry_stopped_in_hook.lock(), Some(false));
        assert!(event_loop.registry().is_stopped());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn shutdown_logs_unretrieved_failures() {
    with_watchdog(|| {
        let capture = LogCapture::new();
        let event_loop = started_loop();

        let failed = event_loop.run(|| divide(4, 0)).unwrap();
        assert!(matches!(failed.wait(TIMEOUT), Err(Error::Failed(_))));

        let stashed = event_loop.run(|| divide(4, 0)).unwrap();
        let _handle = stashed.stash().unwrap();

        // Let the stashed work finish before shutting down.
        event_loop
            .wait_for(|| Ok::<_, Infallible>(()), TIMEOUT)
            .unwrap();
        drop(failed);

        capture.run(|| event_loop.shutdown());
        drop(stashed);

        assert_eq!(capture.error_count(), 1);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn watchdog_shuts_down_when_starting_thread_exits() {
    with_watchdog(|| {
        let (pending_tx, pending_rx) = mpsc::channel();

        let starter = thread::spawn(move || {
            let event_loop = EventLoop::builder()
                .result_store(Arc::new(ResultStore::new()))
                .watchdog_interval(Duration::from_millis(10))
                .build();
            event_loop.start().unwrap();

            pending_tx.send(event_loop.pending::<u32>().unwrap()).unwrap();
        });
        starter.join().unwrap();

        let (result, _resolver) = pending_rx.recv().unwrap();

        assert!(matches!(result.wait(TIMEOUT), Err(Error::LoopStopped)));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn custom_shutdown_condition_triggers_shutdown() {
    with_watchdog(|| {
        let exiting = Arc::new(AtomicBool::new(false));

        let exiting_clone = Arc::clone(&exiting);
        let event_loop = EventLoop::builder()
            .result_store(Arc::new(ResultStore::new()))
            .shutdown_condition(move || exiting_clone.load(Ordering::Relaxed))
            .watchdog_interval(Duration::from_millis(10))
            .thread_name("custom-loop")
            .build();
        event_loop.start().unwrap();

        let (result, _resolver) = event_loop.pending::<u32>().unwrap();
        assert!(matches!(
            result.wait(Duration::from_millis(50)),
            Err(Error::TimedOut)
        ));

        exiting.store(true, Ordering::Relaxed);

        assert!(matches!(result.wait(TIMEOUT), Err(Error::LoopStopped)));
    });
}
