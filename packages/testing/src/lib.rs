#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing and examples in tethered packages.

use std::env;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

/// How long a test may run before it is considered hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Miri executes thread synchronization orders of magnitude slower.
const MIRI_TEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs a test body on a separate thread and fails the test if it does not finish in time.
///
/// Tests that block on event loop results would otherwise hang the whole test run if a result
/// never arrives. A panic in the test body is propagated to the caller unchanged.
///
/// Setting the `MUTATION_TESTING` environment variable to `1` runs the body directly, so that
/// mutation testing can detect mutations that cause hangs by its own timeout.
///
/// # Panics
///
/// Panics if the test body exceeds the timeout, or with the test body's own panic.
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").is_ok_and(|value| value == "1") {
        return test_fn();
    }

    let timeout = if cfg!(miri) {
        MIRI_TEST_TIMEOUT
    } else {
        TEST_TIMEOUT
    };

    let (result_tx, result_rx) = mpsc::channel();

    let test_thread = thread::Builder::new()
        .name("watched-test".to_string())
        .spawn(move || {
            // The receiver is gone if we already timed out, nobody to tell.
            drop(result_tx.send(test_fn()));
        })
        .expect("failed to spawn test thread");

    match result_rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread.join().expect("test thread finished after sending");
            result
        }
        Err(RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, it is probably hung")
        }
        Err(RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Counts the `tracing` events emitted by code running under [`run()`][Self::run].
///
/// Only events emitted on the calling thread are seen, because the capturing subscriber is
/// installed as the thread-local default for the duration of the call.
#[derive(Clone, Debug, Default)]
pub struct LogCapture {
    counts: Arc<LevelCounts>,
}

#[derive(Debug, Default)]
struct LevelCounts {
    errors: AtomicUsize,
    warnings: AtomicUsize,
}

impl LogCapture {
    /// Creates a capture with all counts at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with event capture enabled and returns its result.
    pub fn run<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let subscriber = tracing_subscriber::registry().with(CountingLayer {
            counts: Arc::clone(&self.counts),
        });

        tracing::subscriber::with_default(subscriber, f)
    }

    /// The number of `ERROR` level events captured so far.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.counts.errors.load(Ordering::Relaxed)
    }

    /// The number of `WARN` level events captured so far.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.counts.warnings.load(Ordering::Relaxed)
    }
}

struct CountingLayer {
    counts: Arc<LevelCounts>,
}

impl<S> Layer<S> for CountingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let counter = match *event.metadata().level() {
            Level::ERROR => &self.counts.errors,
            Level::WARN => &self.counts.warnings,
            _ => return,
        };

        counter.fetch_add(1, Ordering::Relaxed);
    }
}
