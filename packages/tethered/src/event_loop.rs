use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use derive_more::Debug;
use futures::FutureExt;
use futures::future::{AbortHandle, Abortable};
use parking_lot::Mutex;
use rsevents::{Awaitable, EventState, ManualResetEvent};
use tracing::{debug, error, trace, warn};

use crate::{
    Error, EventualResult, Failure, FunctionRegistry, Reactor, Resolver, Result, ResultRegistry,
    ResultStore, ShutdownPhase, TokioReactor, Watchdog, panic_message, thread_exit_condition,
};

const DEFAULT_WATCHDOG_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_THREAD_NAME: &str = "tethered-loop";

type ShutdownCondition = Box<dyn Fn() -> bool + Send + 'static>;

/// Lets ordinary blocking threads hand work to a single event loop thread and wait for the
/// results.
///
/// An event loop is started in one of two modes:
///
/// * [`start()`][Self::start] spawns a dedicated thread that runs the [`Reactor`], and arranges
///   for the loop to be stopped and for unretrieved failures to be logged when the process shuts
///   down.
/// * [`start_passive()`][Self::start_passive] is for hosts that already run the reactor
///   themselves. It only makes sure that pending results are unblocked when that loop stops.
///
/// Once started, work is submitted with [`run()`][Self::run] (a synchronous closure) or
/// [`run_async()`][Self::run_async] (a closure producing a future), both of which return an
/// [`EventualResult`] immediately. [`wait_for()`][Self::wait_for] and
/// [`wait_for_async()`][Self::wait_for_async] submit and block in one step.
///
/// # Shutdown
///
/// When `main` returns, Rust terminates the process without waiting for other threads, so call
/// [`shutdown()`][Self::shutdown] before that. A watchdog also triggers shutdown automatically
/// once the thread that called `start()` exits, which covers loops started from threads other
/// than the main thread.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use tethered::{Error, EventLoop, Failure};
///
/// let event_loop = EventLoop::new();
/// event_loop.start().unwrap();
///
/// let sum = event_loop
///     .wait_for(|| Ok::<_, Failure>(2 + 3), Duration::from_secs(10))
///     .unwrap();
/// assert_eq!(sum, 5);
///
/// let failed = event_loop.wait_for(
///     || Err::<u32, _>(Failure::msg("division by zero")),
///     Duration::from_secs(10),
/// );
/// assert!(matches!(failed, Err(Error::Failed(_))));
///
/// event_loop.shutdown();
/// ```
#[derive(Debug)]
pub struct EventLoop {
    reactor: Arc<dyn Reactor>,
    registry: Arc<ResultRegistry>,
    store: Arc<ResultStore>,
    exit_hooks: Arc<FunctionRegistry>,

    watchdog_interval: Duration,
    shutdown_grace: Duration,
    thread_name: String,

    lifecycle: Mutex<Lifecycle>,
}

#[derive(Debug)]
enum Lifecycle {
    Uninitialized {
        #[debug(ignore)]
        shutdown_condition: Option<ShutdownCondition>,
    },
    Running { watchdog: Arc<Watchdog> },
    Passive,
}

impl EventLoop {
    /// Creates an event loop with default settings, driven by a new [`TokioReactor`].
    ///
    /// Use [`EventLoop::builder()`] for custom configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the event loop.
    #[must_use]
    pub fn builder() -> EventLoopBuilder {
        EventLoopBuilder::new()
    }

    /// Starts the event loop on a dedicated thread.
    ///
    /// Calling this again after a successful start has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyPassive`] if the event loop was started with
    /// [`start_passive()`][Self::start_passive].
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the loop thread.
    pub fn start(&self) -> Result<()> {
        // Held for the whole transition, so concurrent callers observe either no loop or a fully
        // wired one.
        let mut lifecycle = self.lifecycle.lock();

        let condition = match &mut *lifecycle {
            Lifecycle::Running { .. } => return Ok(()),
            Lifecycle::Passive => return Err(Error::AlreadyPassive),
            Lifecycle::Uninitialized { shutdown_condition } => shutdown_condition.take(),
        };

        self.stop_registry_on_shutdown();

        let loop_exited = Arc::new(ManualResetEvent::new(EventState::Unset));

        // Exit hooks run in reverse, so the loop is stopped before the store is swept.
        let store = Arc::clone(&self.store);
        let swept_reactor = Arc::clone(&self.reactor);
        self.exit_hooks.register(move || {
            store.sweep_unretrieved_from(&swept_reactor);
        });

        let reactor = Arc::clone(&self.reactor);
        let exited = Arc::clone(&loop_exited);
        let grace = self.shutdown_grace;
        self.exit_hooks
            .register(move || stop_loop(&reactor, &exited, grace));

        let reactor = Arc::clone(&self.reactor);
        thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                debug!("event loop thread started");

                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| reactor.run())) {
                    error!(
                        panic_message = %panic_message(&*payload),
                        "event loop thread panicked"
                    );
                }

                loop_exited.set();
                debug!("event loop thread exiting");
            })
            .expect("failed to spawn event loop thread - the process cannot continue");

        let condition = condition.unwrap_or_else(|| Box::new(thread_exit_condition()));

        let exit_hooks = Arc::clone(&self.exit_hooks);
        let watchdog = Watchdog::start(
            condition,
            move || {
                exit_hooks.run();
            },
            self.watchdog_interval,
        );

        *lifecycle = Lifecycle::Running {
            watchdog: Arc::new(watchdog),
        };

        debug!(thread_name = %self.thread_name, "event loop started");

        Ok(())
    }

    /// Prepares the event loop for use with a reactor that the host runs itself.
    ///
    /// Only arranges for pending results to fail with [`Error::LoopStopped`] when the reactor
    /// stops. No thread is spawned and no exit hooks are registered. Calling this again has no
    /// effect.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the event loop was started with
    /// [`start()`][Self::start].
    pub fn start_passive(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();

        match *lifecycle {
            Lifecycle::Passive => return Ok(()),
            Lifecycle::Running { .. } => return Err(Error::AlreadyStarted),
            Lifecycle::Uninitialized { .. } => {}
        }

        self.stop_registry_on_shutdown();
        *lifecycle = Lifecycle::Passive;

        debug!("event loop started in passive mode");

        Ok(())
    }

    fn stop_registry_on_shutdown(&self) {
        let registry = Arc::clone(&self.registry);

        self.reactor.add_shutdown_trigger(
            ShutdownPhase::BeforeShutdown,
            Box::new(move || {
                registry.stop();
            }),
        );
    }

    /// Schedules a synchronous closure to run on the event loop thread.
    ///
    /// Returns immediately. A panic in the closure fails the result with a
    /// [`Panicked`][crate::Panicked] failure.
    ///
    /// # Errors
    ///
    /// * [`Error::NotStarted`] if the event loop has not been started.
    /// * [`Error::RegistryClosed`] if the event loop has already stopped.
    pub fn run<F, T, E>(&self, work: F) -> Result<EventualResult<T>>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<Failure>,
    {
        let (result, resolver) = self.pending()?;

        self.reactor
            .call_from_thread(Box::new(move || execute(resolver, work)));

        Ok(result)
    }

    /// Schedules a synchronous closure that receives the reactor as its argument.
    ///
    /// Otherwise identical to [`run()`][Self::run].
    ///
    /// # Errors
    ///
    /// The same as [`run()`][Self::run].
    pub fn run_with_reactor<F, T, E>(&self, work: F) -> Result<EventualResult<T>>
    where
        F: FnOnce(&Arc<dyn Reactor>) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<Failure>,
    {
        let reactor = Arc::clone(&self.reactor);

        self.run(move || work(&reactor))
    }

    /// Schedules a closure on the event loop thread and drives the future it returns to
    /// completion there.
    ///
    /// The future never leaves the loop thread, so it does not need to be `Send`. Cancelling
    /// the result aborts the future at its next suspension point.
    ///
    /// # Errors
    ///
    /// The same as [`run()`][Self::run].
    pub fn run_async<F, Fut, T, E>(&self, work: F) -> Result<EventualResult<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
        T: Send + 'static,
        E: Into<Failure>,
    {
        let (result, resolver) = self.pending()?;
        let reactor = Arc::clone(&self.reactor);

        self.reactor.call_from_thread(Box::new(move || {
            let (abort_handle, registration) = AbortHandle::new_pair();

            if !resolver.bind(abort_handle) {
                return;
            }

            let operation = match panic::catch_unwind(AssertUnwindSafe(work)) {
                Ok(operation) => operation,
                Err(payload) => {
                    resolver.fail(Failure::from_panic(&*payload));
                    return;
                }
            };

            reactor.spawn_local(Box::pin(async move {
                let guarded = AssertUnwindSafe(operation).catch_unwind();

                match Abortable::new(guarded, registration).await {
                    Ok(Ok(outcome)) => resolver.resolve(outcome),
                    Ok(Err(payload)) => resolver.fail(Failure::from_panic(&*payload)),
                    Err(_aborted) => {
                        trace!("loop-local operation aborted");
                        resolver.complete(Err(Error::Cancelled));
                    }
                }
            }));
        }));

        Ok(result)
    }

    /// Runs a synchronous closure on the event loop thread and waits up to `timeout` for its
    /// result.
    ///
    /// If the timeout elapses, the operation is cancelled before [`Error::TimedOut`] is returned.
    ///
    /// # Errors
    ///
    /// Any error from [`run()`][Self::run] or [`EventualResult::wait()`].
    pub fn wait_for<F, T, E>(&self, work: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce() -> std::result::Result<T, E> + Send + 'static,
        T: Clone + Send + 'static,
        E: Into<Failure>,
    {
        self.ensure_off_loop_thread()?;

        wait_or_cancel(&self.run(work)?, timeout)
    }

    /// Runs an asynchronous closure on the event loop thread and waits up to `timeout` for its
    /// result.
    ///
    /// If the timeout elapses, the operation is cancelled before [`Error::TimedOut`] is returned.
    ///
    /// # Errors
    ///
    /// Any error from [`run_async()`][Self::run_async] or [`EventualResult::wait()`].
    pub fn wait_for_async<F, Fut, T, E>(&self, work: F, timeout: Duration) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
        T: Clone + Send + 'static,
        E: Into<Failure>,
    {
        self.ensure_off_loop_thread()?;

        wait_or_cancel(&self.run_async(work)?, timeout)
    }

    /// Creates a registered result together with the [`Resolver`] that completes it.
    ///
    /// For host code that produces results from its own callbacks on the loop thread. The
    /// result fails with [`Error::LoopStopped`] if the event loop stops before it is resolved.
    ///
    /// # Errors
    ///
    /// The same as [`run()`][Self::run].
    pub fn pending<T>(&self) -> Result<(EventualResult<T>, Resolver<T>)>
    where
        T: Send + 'static,
    {
        if matches!(*self.lifecycle.lock(), Lifecycle::Uninitialized { .. }) {
            return Err(Error::NotStarted);
        }

        let (result, resolver) =
            EventualResult::detached(Arc::clone(&self.reactor), &self.store);

        self.registry.register(&result)?;

        Ok((result, resolver))
    }

    /// Takes the result stored under `id` out of this event loop's [`ResultStore`].
    ///
    /// # Errors
    ///
    /// The same as [`ResultStore::retrieve()`].
    pub fn retrieve<T>(&self, id: u64) -> Result<EventualResult<T>>
    where
        T: Send + 'static,
    {
        self.store.retrieve(id)
    }

    /// Adds application cleanup that runs when the process shuts down.
    ///
    /// Hooks run in reverse registration order. Hooks registered after [`start()`][Self::start]
    /// therefore run before the event loop is stopped.
    pub fn register_exit_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.exit_hooks.register(hook);
    }

    /// Shuts down immediately: stops the watchdog and runs the exit hooks, which stop the event
    /// loop and log unretrieved failures.
    ///
    /// Every pending result fails with [`Error::LoopStopped`]. Calling this more than once, or
    /// after the watchdog has already fired, has no further effect.
    pub fn shutdown(&self) {
        let watchdog = match &*self.lifecycle.lock() {
            Lifecycle::Running { watchdog } => Some(Arc::clone(watchdog)),
            Lifecycle::Uninitialized { .. } | Lifecycle::Passive => None,
        };

        if let Some(watchdog) = watchdog {
            watchdog.stop();
        }

        let ran = self.exit_hooks.run();

        debug!(exit_hooks = ran, "event loop shut down");
    }

    /// The reactor that drives this event loop.
    #[must_use]
    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.reactor
    }

    /// The registry that tracks this event loop's pending results.
    #[must_use]
    pub fn registry(&self) -> &Arc<ResultRegistry> {
        &self.registry
    }

    /// The store that [`EventualResult::stash()`] uses for results of this event loop.
    #[must_use]
    pub fn result_store(&self) -> &Arc<ResultStore> {
        &self.store
    }

    fn ensure_off_loop_thread(&self) -> Result<()> {
        if self.reactor.is_loop_thread() {
            return Err(Error::WaitOnLoopThread);
        }

        Ok(())
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring an [`EventLoop`].
#[derive(Debug)]
pub struct EventLoopBuilder {
    reactor: Option<Arc<dyn Reactor>>,
    result_store: Option<Arc<ResultStore>>,
    exit_hooks: Option<Arc<FunctionRegistry>>,

    #[debug(ignore)]
    shutdown_condition: Option<ShutdownCondition>,

    watchdog_interval: Duration,
    shutdown_grace: Duration,
    thread_name: String,
}

impl EventLoopBuilder {
    fn new() -> Self {
        Self {
            reactor: None,
            result_store: None,
            exit_hooks: None,
            shutdown_condition: None,
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Sets the reactor that drives the event loop.
    ///
    /// Default is a new [`TokioReactor`].
    #[must_use]
    pub fn reactor(mut self, reactor: Arc<dyn Reactor>) -> Self {
        self.reactor = Some(reactor);
        self
    }

    /// Sets the store that stashed results go to.
    ///
    /// Default is a new store owned by this event loop. Pass [`ResultStore::global()`] or another
    /// shared store to redeem handles across event loops; each loop only sweeps its own results
    /// from a shared store when it shuts down.
    #[must_use]
    pub fn result_store(mut self, store: Arc<ResultStore>) -> Self {
        self.result_store = Some(store);
        self
    }

    /// Sets the registry that process shutdown hooks are added to.
    ///
    /// Default is a registry owned by this event loop. Sharing one registry between event loops
    /// lets a single [`FunctionRegistry::run()`] shut all of them down.
    #[must_use]
    pub fn exit_hooks(mut self, exit_hooks: Arc<FunctionRegistry>) -> Self {
        self.exit_hooks = Some(exit_hooks);
        self
    }

    /// Sets the condition the watchdog polls to detect that the process is shutting down.
    ///
    /// Default is "the thread that called [`EventLoop::start()`] has exited".
    #[must_use]
    pub fn shutdown_condition<C>(mut self, condition: C) -> Self
    where
        C: Fn() -> bool + Send + 'static,
    {
        self.shutdown_condition = Some(Box::new(condition));
        self
    }

    /// Sets how often the watchdog checks the shutdown condition.
    ///
    /// Default is 100 milliseconds.
    #[must_use]
    pub fn watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    /// Sets how long shutdown waits for the event loop thread to finish.
    ///
    /// Default is 5 seconds.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets the name of the event loop thread.
    ///
    /// Default is `tethered-loop`.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Builds the event loop with the configured settings. The loop is not started.
    #[must_use]
    pub fn build(self) -> EventLoop {
        let reactor = self.reactor.unwrap_or_else(|| {
            let reactor: Arc<dyn Reactor> = Arc::new(TokioReactor::new());
            reactor
        });

        EventLoop {
            reactor,
            registry: Arc::new(ResultRegistry::new()),
            store: self
                .result_store
                .unwrap_or_else(|| Arc::new(ResultStore::new())),
            exit_hooks: self.exit_hooks.unwrap_or_default(),
            watchdog_interval: self.watchdog_interval,
            shutdown_grace: self.shutdown_grace,
            thread_name: self.thread_name,
            lifecycle: Mutex::new(Lifecycle::Uninitialized {
                shutdown_condition: self.shutdown_condition,
            }),
        }
    }
}

fn execute<F, T, E>(resolver: Resolver<T>, work: F)
where
    F: FnOnce() -> std::result::Result<T, E>,
    T: Send + 'static,
    E: Into<Failure>,
{
    if !resolver.begin() {
        return;
    }

    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(outcome) => resolver.resolve(outcome),
        Err(payload) => resolver.fail(Failure::from_panic(&*payload)),
    }
}

fn wait_or_cancel<T>(result: &EventualResult<T>, timeout: Duration) -> Result<T>
where
    T: Clone + Send + 'static,
{
    match result.wait(timeout) {
        Err(Error::TimedOut) => {
            result.cancel();
            Err(Error::TimedOut)
        }
        outcome => outcome,
    }
}

fn stop_loop(reactor: &Arc<dyn Reactor>, loop_exited: &ManualResetEvent, grace: Duration) {
    let stopping = Arc::clone(reactor);
    reactor.call_from_thread(Box::new(move || stopping.stop()));

    // The loop thread itself cannot wait for the loop to finish.
    if reactor.is_loop_thread() {
        return;
    }

    if !loop_exited.wait_for(grace) {
        warn!(
            ?grace,
            "event loop thread did not finish within the shutdown grace period"
        );
    }
}
