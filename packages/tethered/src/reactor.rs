//! The capability interface through which this crate talks to an event loop.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;

/// A unit of work handed to the event loop thread.
pub type LoopTask = Box<dyn FnOnce() + Send + 'static>;

/// A loop-local operation that the reactor drives to completion on its own thread.
///
/// The operation is created on the loop thread and never leaves it, so it does not need to be
/// `Send`.
pub type LocalOperation = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// When a shutdown trigger runs, relative to the moment the loop stops processing work.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ShutdownPhase {
    /// The loop has decided to stop but has not yet torn down its pending operations.
    BeforeShutdown,

    /// The loop has stopped processing work and its pending operations are gone.
    AfterShutdown,
}

/// A single-threaded event loop that the crate schedules work onto.
///
/// Implementations own exactly one loop thread: the thread that calls [`run()`][Self::run].
/// Every other method may be called from any thread unless documented otherwise.
///
/// [`TokioReactor`][crate::TokioReactor] is the implementation provided by this crate. Host
/// applications that already drive their own loop implement this trait over it and use
/// [`EventLoop::start_passive()`][crate::EventLoop::start_passive].
#[cfg_attr(test, mockall::automock)]
pub trait Reactor: Debug + Send + Sync + 'static {
    /// Drives the event loop on the calling thread until it is stopped.
    ///
    /// The calling thread becomes the loop thread.
    fn run(&self);

    /// Schedules a task to run on the loop thread.
    ///
    /// Tasks submitted from the same thread run in submission order. If the loop has already
    /// stopped, the task is dropped without running.
    fn call_from_thread(&self, task: LoopTask);

    /// Registers a hook that runs on the loop thread during the given phase of loop shutdown.
    fn add_shutdown_trigger(&self, phase: ShutdownPhase, hook: LoopTask);

    /// Requests that the loop stop.
    ///
    /// This is meant to be invoked on the loop thread, via
    /// [`call_from_thread()`][Self::call_from_thread].
    fn stop(&self);

    /// Returns `true` if the calling thread is the loop thread.
    fn is_loop_thread(&self) -> bool;

    /// Starts driving a loop-local operation.
    ///
    /// Must be called on the loop thread. The operation is dropped without completing if the
    /// loop stops first.
    fn spawn_local(&self, operation: LocalOperation);
}
