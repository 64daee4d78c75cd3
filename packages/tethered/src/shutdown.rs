//! Process-exit detection and the hooks that run when the process is going away.

use std::any::type_name;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::panic_message;

/// A callable registered to run when the process shuts down.
pub type ExitHook = Box<dyn FnOnce() + Send + 'static>;

/// An ordered list of [`ExitHook`]s that runs at most once.
///
/// Hooks run in reverse registration order, so whatever was set up last is torn down first.
/// A hook that panics is logged and does not prevent the remaining hooks from running.
///
/// Running the registry drains it; hooks registered afterwards wait for the next
/// [`run()`][Self::run].
pub struct FunctionRegistry {
    hooks: Mutex<Vec<ExitHook>>,
}

impl FunctionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Adds a hook to the end of the list.
    pub fn register<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Runs every registered hook in reverse registration order and returns how many ran.
    ///
    /// Concurrent calls never run the same hook twice.
    pub fn run(&self) -> usize {
        let hooks = mem::take(&mut *self.hooks.lock());
        let count = hooks.len();

        debug!(count, "running exit hooks");

        for hook in hooks.into_iter().rev() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(hook)) {
                error!(
                    panic_message = %panic_message(&*payload),
                    "exit hook panicked"
                );
            }
        }

        count
    }

    /// The number of hooks waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.lock().len()
    }

    /// Returns `true` if no hooks are waiting to run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.lock().is_empty()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FunctionRegistry {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("hook_count", &self.len())
            .finish()
    }
}

/// A background thread that polls a shutdown condition and calls back once it holds.
///
/// The callback runs on the watchdog thread, at most once. [`stop()`][Self::stop] ends the
/// watch without invoking the callback.
pub struct Watchdog {
    control: Arc<WatchdogControl>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct WatchdogControl {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Watchdog {
    /// Starts watching `condition`, checking it every `interval`.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the watchdog thread.
    #[must_use]
    pub fn start<C, F>(condition: C, on_shutdown: F, interval: Duration) -> Self
    where
        C: Fn() -> bool + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        #[expect(clippy::mutex_atomic, reason = "the flag is waited on through a Condvar")]
        let control = Arc::new(WatchdogControl {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread_control = Arc::clone(&control);

        let thread = thread::Builder::new()
            .name("tethered-watchdog".to_string())
            .spawn(move || watch(&thread_control, &condition, on_shutdown, interval))
            .expect("failed to spawn watchdog thread - the process cannot continue");

        debug!(?interval, "watchdog started");

        Self {
            control,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Stops watching. Safe to call more than once and from within the callback itself.
    pub fn stop(&self) {
        *self.control.stopped.lock() = true;
        self.control.wake.notify_all();

        let Some(thread) = self.thread.lock().take() else {
            return;
        };

        // The callback may stop its own watchdog; a thread cannot join itself.
        if thread.thread().id() == thread::current().id() {
            return;
        }

        if thread.join().is_err() {
            error!("watchdog thread panicked");
        }

        debug!("watchdog stopped");
    }

    /// Returns `true` until the watchdog has fired or been stopped.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }
}

impl fmt::Debug for Watchdog {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn watch<C, F>(control: &WatchdogControl, condition: &C, on_shutdown: F, interval: Duration)
where
    C: Fn() -> bool,
    F: FnOnce(),
{
    loop {
        if *control.stopped.lock() {
            return;
        }

        if condition() {
            debug!("shutdown condition met, watchdog firing");
            on_shutdown();
            return;
        }

        let mut stopped = control.stopped.lock();

        if !*stopped {
            control.wake.wait_for(&mut stopped, interval);
        }
    }
}

thread_local! {
    static LIVENESS: Arc<()> = Arc::new(());
}

/// Returns a shutdown condition that holds once the calling thread has exited.
///
/// Thread-local storage of the main thread is not destroyed when `main` returns, so a condition
/// created on the main thread never holds. Call [`EventLoop::shutdown()`][crate::EventLoop::shutdown]
/// before returning from `main` instead.
#[must_use]
pub fn thread_exit_condition() -> impl Fn() -> bool + Send + Sync + 'static {
    let token: Weak<()> = LIVENESS.with(Arc::downgrade);

    move || token.strong_count() == 0
}
