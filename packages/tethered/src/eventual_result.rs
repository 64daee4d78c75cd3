//! The single-assignment result cell shared between the loop thread and waiting threads.

use std::any::type_name;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::AbortHandle;
use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::{Error, Failure, Reactor, Result, ResultStore};

pub(crate) type Outcome<T> = std::result::Result<T, Error>;

/// A blocking, thread-safe handle to the result of work scheduled on the event loop thread.
///
/// The result is assigned exactly once, either when the work completes or when the event loop
/// stops (in which case every pending result fails with [`Error::LoopStopped`]). Any number of
/// threads may [`wait()`][Self::wait] for it, any number of times, and all of them observe the
/// same outcome.
///
/// Handles are cheap to clone; all clones refer to the same result.
///
/// # Unhandled failures
///
/// If the last handle is dropped while the result holds a failure that nobody has looked at,
/// the failure is logged as an error so it is never silently lost. The same applies to failures
/// that arrive after all handles were already dropped. Looking at the outcome via
/// [`wait()`][Self::wait] or [`peek_failure()`][Self::peek_failure] suppresses this.
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
/// use std::time::Duration;
///
/// use tethered::{EventLoop, ResultStore};
///
/// let event_loop = EventLoop::builder()
///     .result_store(ResultStore::new().into())
///     .build();
/// event_loop.start().unwrap();
///
/// let result = event_loop.run(|| Ok::<_, Infallible>(2 + 3)).unwrap();
///
/// assert_eq!(result.wait(Duration::from_secs(10)).unwrap(), 5);
/// // The outcome is not consumed by waiting.
/// assert_eq!(result.wait(Duration::from_secs(10)).unwrap(), 5);
/// # event_loop.shutdown();
/// ```
pub struct EventualResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> EventualResult<T>
where
    T: Send + 'static,
{
    /// Creates a result that is not yet bound to any operation, together with the resolver
    /// that the loop side uses to complete it.
    pub(crate) fn detached(
        reactor: Arc<dyn Reactor>,
        store: &Arc<ResultStore>,
    ) -> (Self, Resolver<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                outcome: None,
                retrieved: false,
                operation: Operation::Unbound,
            }),
            resolved: Condvar::new(),
            reactor,
            store: Arc::downgrade(store),
        });

        let resolver = Resolver {
            shared: Arc::downgrade(&shared),
            finished: false,
        };

        (Self { shared }, resolver)
    }

    /// Blocks until the result is available or `timeout` elapses.
    ///
    /// Returns the value produced by the work, or its terminal failure. If the timeout elapses
    /// first, returns [`Error::TimedOut`]; the result is unaffected and a later call may still
    /// observe it.
    ///
    /// # Errors
    ///
    /// * [`Error::TimedOut`] if no result arrived in time.
    /// * [`Error::Failed`] if the work failed or panicked.
    /// * [`Error::LoopStopped`] if the event loop stopped before the work completed.
    /// * [`Error::Cancelled`] if the work was cancelled.
    /// * [`Error::WaitOnLoopThread`] if called on the event loop thread, where blocking would
    ///   deadlock the loop.
    pub fn wait(&self, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        // A timeout too large to represent is as good as no timeout at all.
        self.wait_until(Instant::now().checked_add(timeout))
    }

    /// Blocks until the result is available, however long that takes.
    ///
    /// Stopping the event loop resolves every pending result, so this cannot block past the end
    /// of the loop.
    ///
    /// # Errors
    ///
    /// The same as [`wait()`][Self::wait], except that it never times out.
    pub fn wait_unbounded(&self) -> Result<T>
    where
        T: Clone,
    {
        self.wait_until(None)
    }

    fn wait_until(&self, deadline: Option<Instant>) -> Result<T>
    where
        T: Clone,
    {
        if self.shared.reactor.is_loop_thread() {
            return Err(Error::WaitOnLoopThread);
        }

        let mut state = self.shared.state.lock();

        loop {
            if let Some(outcome) = &state.outcome {
                let outcome = outcome.clone();
                state.retrieved = true;
                return outcome;
            }

            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .resolved
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.outcome.is_none()
                    {
                        return Err(Error::TimedOut);
                    }
                }
                None => self.shared.resolved.wait(&mut state),
            }
        }
    }

    /// Returns `true` if the outcome has been assigned.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    /// Requests cancellation of the underlying operation.
    ///
    /// The request is delivered to the event loop thread and this call returns immediately.
    /// Whether the operation actually stops depends on how far it has progressed: work that has
    /// already completed keeps its result, synchronous work that is already running finishes
    /// normally, and asynchronous work is aborted at its next suspension point, failing with
    /// [`Error::Cancelled`].
    ///
    /// Calling this any number of times, from any thread, before or after resolution, is safe.
    pub fn cancel(&self) {
        if self.is_resolved() {
            return;
        }

        trace!(
            value_type = type_name::<T>(),
            "dispatching cancellation to event loop thread"
        );

        let shared = Arc::clone(&self.shared);
        self.shared
            .reactor
            .call_from_thread(Box::new(move || shared.cancel_on_loop_thread()));
    }

    /// Stores this result in its [`ResultStore`] and returns a handle for retrieving it later.
    ///
    /// The handle is a plain integer, so it can cross boundaries that cannot carry the result
    /// itself, such as a web session. See [`ResultStore::retrieve()`].
    ///
    /// The result does not keep its store alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreDropped`] if the store no longer exists.
    pub fn stash(&self) -> Result<u64> {
        let store = self.shared.store.upgrade().ok_or(Error::StoreDropped)?;

        Ok(store.store(self.clone()))
    }

    /// Returns the terminal failure, if the result is already available and is a failure.
    ///
    /// Never blocks. If the result is available, this counts as having looked at it, so the
    /// result is no longer reported as an unhandled failure when dropped.
    #[must_use]
    pub fn peek_failure(&self) -> Option<Error> {
        let mut state = self.shared.state.lock();

        let failure = match &state.outcome {
            Some(Err(error)) => Some(error.clone()),
            Some(Ok(_)) => None,
            None => return None,
        };

        state.retrieved = true;
        failure
    }

    /// Returns a non-owning handle for the registry.
    pub(crate) fn as_resolvable(&self) -> Weak<dyn Resolvable> {
        let weak: Weak<dyn Resolvable> = Arc::<Shared<T>>::downgrade(&self.shared);
        weak
    }

    /// Returns `true` if the result was created for work driven by `reactor`.
    pub(crate) fn is_driven_by(&self, reactor: &Arc<dyn Reactor>) -> bool {
        Arc::ptr_eq(&self.shared.reactor, reactor)
    }

    /// Returns `true` if both handles refer to the same result.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Clone for EventualResult<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for EventualResult<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();

        f.debug_struct(type_name::<Self>())
            .field("resolved", &state.outcome.is_some())
            .field("retrieved", &state.retrieved)
            .finish_non_exhaustive()
    }
}

/// The loop side of an [`EventualResult`], used to assign its outcome.
///
/// Obtained from [`EventLoop::pending()`][crate::EventLoop::pending] when host code wants to
/// complete a result itself, typically from a callback that runs on the event loop thread.
///
/// A resolver assigns the outcome at most once; if the outcome was already assigned (for
/// example because the event loop stopped) the new outcome is discarded. Dropping a resolver
/// without using it resolves the result with [`Error::Cancelled`].
///
/// The resolver does not keep the result alive. If every [`EventualResult`] handle is dropped
/// before the resolver is used, a failure passed to the resolver is logged instead.
pub struct Resolver<T> {
    shared: Weak<Shared<T>>,
    finished: bool,
}

impl<T> Resolver<T>
where
    T: Send + 'static,
{
    /// Resolves the result with the outcome of the work.
    pub fn resolve<E>(self, outcome: std::result::Result<T, E>)
    where
        E: Into<Failure>,
    {
        self.complete(outcome.map_err(|e| Error::Failed(e.into())));
    }

    /// Resolves the result with a value.
    pub fn succeed(self, value: T) {
        self.complete(Ok(value));
    }

    /// Resolves the result with a failure.
    pub fn fail(self, failure: impl Into<Failure>) {
        self.complete(Err(Error::Failed(failure.into())));
    }

    /// Returns `true` if someone asked for the operation to be cancelled before it was bound.
    ///
    /// Long-running host code can check this to skip work nobody wants any more.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            matches!(shared.state.lock().operation, Operation::CancelRequested)
        })
    }

    /// Assigns the outcome, or reports it if nobody holds the result any more.
    pub(crate) fn complete(mut self, outcome: Outcome<T>) {
        self.finished = true;

        if let Some(shared) = self.shared.upgrade() {
            shared.complete(outcome);
            return;
        }

        if let Err(error) = &outcome {
            if is_reportable(error) {
                error!(
                    value_type = type_name::<T>(),
                    error = %error,
                    "unhandled error in eventual result whose handles were all dropped"
                );
            }
        }
    }

    /// Marks synchronous work as started. Returns `false` if the work must not run, either
    /// because cancellation was requested (the result is then resolved as cancelled) or because
    /// the result is already resolved.
    pub(crate) fn begin(&self) -> bool {
        self.transition(Operation::Running)
    }

    /// Binds the result to an abortable loop-local operation. Returns `false` if the operation
    /// must not be started, under the same conditions as [`begin()`][Self::begin].
    pub(crate) fn bind(&self, abort_handle: AbortHandle) -> bool {
        self.transition(Operation::Bound(abort_handle))
    }

    fn transition(&self, next: Operation) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            // Nobody is waiting but the work still runs, so its failures still get reported.
            return true;
        };

        let mut state = shared.state.lock();

        match state.operation {
            Operation::Unbound => {
                state.operation = next;
                true
            }
            Operation::CancelRequested => {
                drop(state);
                trace!(
                    value_type = type_name::<T>(),
                    "operation cancelled before it started"
                );
                shared.complete(Err(Error::Cancelled));
                false
            }
            Operation::Running | Operation::Bound(_) | Operation::Finished => false,
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        if let Some(shared) = self.shared.upgrade() {
            shared.complete(Err(Error::Cancelled));
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("finished", &self.finished)
            .field("result_alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

/// Type-erased view of a result, used by the registry to force an outcome.
pub(crate) trait Resolvable: Send + Sync {
    /// Assigns the failure if no outcome has been assigned yet. Returns `true` if it was.
    fn resolve_with(&self, error: Error) -> bool;
}

impl<T> Resolvable for Shared<T>
where
    T: Send,
{
    fn resolve_with(&self, error: Error) -> bool {
        self.complete(Err(error))
    }
}

/// Whether an unretrieved terminal failure deserves an error log entry.
///
/// Cancellation is always requested by the owner of the result, so nobody needs telling.
pub(crate) fn is_reportable(error: &Error) -> bool {
    !matches!(error, Error::Cancelled)
}

pub(crate) struct Shared<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,

    reactor: Arc<dyn Reactor>,
    store: Weak<ResultStore>,
}

struct State<T> {
    outcome: Option<Outcome<T>>,

    // Set once any caller has observed the terminal outcome.
    retrieved: bool,

    operation: Operation,
}

enum Operation {
    Unbound,
    CancelRequested,
    Running,
    Bound(AbortHandle),
    Finished,
}

impl<T> Shared<T> {
    fn complete(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.state.lock();

        if state.outcome.is_some() {
            drop(state);
            trace!(
                value_type = type_name::<T>(),
                "discarding outcome for already resolved result"
            );
            return false;
        }

        state.outcome = Some(outcome);
        state.operation = Operation::Finished;
        drop(state);

        self.resolved.notify_all();
        trace!(value_type = type_name::<T>(), "eventual result resolved");

        true
    }

    fn cancel_on_loop_thread(&self) {
        let mut state = self.state.lock();

        let abort_handle = match &state.operation {
            Operation::Unbound => {
                state.operation = Operation::CancelRequested;
                return;
            }
            Operation::Bound(abort_handle) => abort_handle.clone(),
            Operation::CancelRequested | Operation::Running | Operation::Finished => return,
        };

        drop(state);

        trace!(
            value_type = type_name::<T>(),
            "aborting loop-local operation"
        );
        abort_handle.abort();
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if state.retrieved {
            return;
        }

        if let Some(Err(error)) = &state.outcome {
            if is_reportable(error) {
                error!(
                    value_type = type_name::<T>(),
                    error = %error,
                    "unhandled error in eventual result"
                );
            }
        }
    }
}
