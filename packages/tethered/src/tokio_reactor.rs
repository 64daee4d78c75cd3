use std::any::type_name;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{self, LocalSet};
use tracing::{debug, error, warn};

use crate::{LocalOperation, LoopTask, Reactor, ShutdownPhase, panic_message};

enum Command {
    Call(LoopTask),
    Stop,
}

/// A [`Reactor`] backed by a Tokio current-thread runtime.
///
/// The thread that calls [`run()`][Reactor::run] drives a `LocalSet` on a dedicated runtime
/// with the time driver enabled, so loop-local operations may use Tokio timers and any other
/// `!Send` state they like.
///
/// Tasks submitted with [`call_from_thread()`][Reactor::call_from_thread] run one at a time, in
/// submission order, in between polls of the loop-local operations. A task that panics is
/// logged and does not bring down the loop.
///
/// When the loop stops, the [`ShutdownPhase::BeforeShutdown`] triggers run first, then all
/// still-pending loop-local operations are dropped together with any queued tasks, and finally
/// the [`ShutdownPhase::AfterShutdown`] triggers run. A reactor drives at most one loop.
pub struct TokioReactor {
    commands: UnboundedSender<Command>,
    receiver: Mutex<Option<UnboundedReceiver<Command>>>,

    triggers: Mutex<Vec<(ShutdownPhase, LoopTask)>>,

    loop_thread: OnceLock<ThreadId>,
    stop_requested: AtomicBool,
}

impl TokioReactor {
    /// Creates a reactor that has not started running yet.
    #[must_use]
    pub fn new() -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();

        Self {
            commands,
            receiver: Mutex::new(Some(receiver)),
            triggers: Mutex::new(Vec::new()),
            loop_thread: OnceLock::new(),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn drive(&self, runtime: &Runtime, receiver: &mut UnboundedReceiver<Command>) {
        let local = LocalSet::new();

        local.block_on(runtime, async {
            while let Some(command) = receiver.recv().await {
                match command {
                    Command::Call(task) => run_guarded(task, "event loop task panicked"),
                    Command::Stop => self.stop_requested.store(true, Ordering::Release),
                }

                // Acquire pairs with the Release in stop(), which may run inside the task.
                if self.stop_requested.load(Ordering::Acquire) {
                    break;
                }
            }

            self.run_triggers(ShutdownPhase::BeforeShutdown);
        });

        // Dropping the LocalSet drops every loop-local operation that has not completed.
        drop(local);
    }

    fn run_triggers(&self, phase: ShutdownPhase) {
        let (matching, remaining): (Vec<_>, Vec<_>) = mem::take(&mut *self.triggers.lock())
            .into_iter()
            .partition(|(trigger_phase, _)| *trigger_phase == phase);

        self.triggers.lock().extend(remaining);

        debug!(?phase, count = matching.len(), "running shutdown triggers");

        for (_, hook) in matching {
            run_guarded(hook, "event loop shutdown trigger panicked");
        }
    }
}

impl Default for TokioReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for TokioReactor {
    fn run(&self) {
        let Some(mut receiver) = self.receiver.lock().take() else {
            warn!("reactor has already driven a loop and cannot be run again");
            return;
        };

        // The receiver can only be taken once, so this is the first and only loop thread.
        drop(self.loop_thread.set(thread::current().id()));

        match Builder::new_current_thread().enable_time().build() {
            Ok(runtime) => {
                debug!("event loop running");
                self.drive(&runtime, &mut receiver);
            }
            Err(error) => {
                error!(%error, "failed to build event loop runtime");
                self.run_triggers(ShutdownPhase::BeforeShutdown);
            }
        }

        // Tasks submitted from now on are dropped by the sender.
        receiver.close();
        drop(receiver);

        self.run_triggers(ShutdownPhase::AfterShutdown);

        debug!("event loop stopped");
    }

    fn call_from_thread(&self, task: LoopTask) {
        if self.commands.send(Command::Call(task)).is_err() {
            debug!("event loop has stopped, dropping task");
        }
    }

    fn add_shutdown_trigger(&self, phase: ShutdownPhase, hook: LoopTask) {
        self.triggers.lock().push((phase, hook));
    }

    fn stop(&self) {
        if self.is_loop_thread() {
            self.stop_requested.store(true, Ordering::Release);
        } else if self.commands.send(Command::Stop).is_err() {
            debug!("event loop has already stopped");
        }
    }

    fn is_loop_thread(&self) -> bool {
        self.loop_thread.get() == Some(&thread::current().id())
    }

    fn spawn_local(&self, operation: LocalOperation) {
        assert!(
            self.is_loop_thread(),
            "loop-local operations can only be spawned on the event loop thread"
        );

        // The operation reports its own outcome, so the join handle is not needed.
        drop(task::spawn_local(operation));
    }
}

impl fmt::Debug for TokioReactor {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("loop_thread", &self.loop_thread.get())
            .field(
                "stop_requested",
                &self.stop_requested.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

fn run_guarded(task: LoopTask, message: &'static str) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(panic_message = %panic_message(&*payload), "{message}");
    }
}
