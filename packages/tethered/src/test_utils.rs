//! A reactor test double that runs loop work only when the test asks for it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use derive_more::Debug;
use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;
use parking_lot::Mutex;

use crate::{LocalOperation, LoopTask, Reactor, ShutdownPhase};

thread_local! {
    static LOCAL_POOL: RefCell<LocalPool> = RefCell::new(LocalPool::new());

    // Kept separately so operations can be spawned while the pool is being driven.
    static LOCAL_SPAWNER: LocalSpawner = LOCAL_POOL.with_borrow(LocalPool::spawner);
}

/// Queues loop work until [`run_pending()`][Self::run_pending] is called. The thread calling
/// `run_pending()` acts as the loop thread for the duration of the call.
#[derive(Debug)]
pub(crate) struct ManualReactor {
    #[debug(ignore)]
    queue: Mutex<VecDeque<LoopTask>>,

    #[debug(ignore)]
    triggers: Mutex<Vec<(ShutdownPhase, LoopTask)>>,

    loop_thread: Mutex<Option<ThreadId>>,
    stopped: AtomicBool,
}

impl ManualReactor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            triggers: Mutex::new(Vec::new()),
            loop_thread: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn as_reactor(self: &Arc<Self>) -> Arc<dyn Reactor> {
        let reactor: Arc<dyn Reactor> = Arc::<Self>::clone(self);
        reactor
    }

    /// Runs queued tasks and loop-local operations on the calling thread until nothing can make
    /// progress. Returns the number of queued tasks executed.
    pub(crate) fn run_pending(&self) -> usize {
        let previous = self.loop_thread.lock().replace(thread::current().id());

        // The spawner borrows the pool when first initialized, which must happen before the
        // pool is mutably borrowed below.
        LOCAL_SPAWNER.with(|_| {});

        let mut executed: usize = 0;

        loop {
            let task = self.queue.lock().pop_front();

            if let Some(task) = task {
                task();
                executed = executed.saturating_add(1);
                continue;
            }

            LOCAL_POOL.with_borrow_mut(LocalPool::run_until_stalled);

            if self.queue.lock().is_empty() {
                break;
            }
        }

        *self.loop_thread.lock() = previous;

        executed
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn trigger_count(&self, phase: ShutdownPhase) -> usize {
        self.triggers
            .lock()
            .iter()
            .filter(|(trigger_phase, _)| *trigger_phase == phase)
            .count()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn run_triggers(&self, phase: ShutdownPhase) {
        let (matching, remaining): (Vec<_>, Vec<_>) = mem::take(&mut *self.triggers.lock())
            .into_iter()
            .partition(|(trigger_phase, _)| *trigger_phase == phase);

        self.triggers.lock().extend(remaining);

        for (_, hook) in matching {
            hook();
        }
    }
}

impl Reactor for ManualReactor {
    fn run(&self) {
        self.run_pending();
    }

    fn call_from_thread(&self, task: LoopTask) {
        if self.is_stopped() {
            return;
        }

        self.queue.lock().push_back(task);
    }

    fn add_shutdown_trigger(&self, phase: ShutdownPhase, hook: LoopTask) {
        self.triggers.lock().push((phase, hook));
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        self.run_triggers(ShutdownPhase::BeforeShutdown);

        let abandoned = mem::take(&mut *self.queue.lock());
        drop(abandoned);

        self.run_triggers(ShutdownPhase::AfterShutdown);
    }

    fn is_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }

    fn spawn_local(&self, operation: LocalOperation) {
        LOCAL_SPAWNER
            .with(|spawner| spawner.spawn_local(operation))
            .expect("thread-local pool outlives every test");
    }
}
