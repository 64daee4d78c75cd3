use std::any::type_name;
use std::fmt;
use std::mem;
use std::sync::Weak;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{Error, EventualResult, Resolvable, Result};

/// Dead entries are pruned from the registry once it grows to at least this many entries.
const MIN_PRUNE_THRESHOLD: usize = 64;

/// Keeps track of the [`EventualResult`]s that may still be waiting for the event loop.
///
/// Once the event loop shuts down, no result will ever arrive from it, so [`stop()`][Self::stop]:
///
/// 1. Makes registering new results an error.
/// 2. Resolves every registered result that is still pending with [`Error::LoopStopped`],
///    unblocking every thread waiting on one.
///
/// The registry only holds weak references: being registered never keeps a result alive.
pub struct ResultRegistry {
    state: Mutex<RegistryState>,
}

struct RegistryState {
    stopped: bool,
    results: Vec<Weak<dyn Resolvable>>,
    prune_at: usize,
}

impl ResultRegistry {
    /// Creates an empty registry that accepts registrations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                stopped: false,
                results: Vec::new(),
                prune_at: MIN_PRUNE_THRESHOLD,
            }),
        }
    }

    /// Registers a result so that it is resolved if the event loop stops first.
    ///
    /// May be called from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegistryClosed`] if [`stop()`][Self::stop] has already been called.
    pub fn register<T>(&self, result: &EventualResult<T>) -> Result<()>
    where
        T: Send + 'static,
    {
        let mut state = self.state.lock();

        if state.stopped {
            return Err(Error::RegistryClosed);
        }

        if state.results.len() >= state.prune_at {
            state.results.retain(|result| result.strong_count() > 0);
            state.prune_at = state
                .results
                .len()
                .saturating_mul(2)
                .max(MIN_PRUNE_THRESHOLD);
        }

        state.results.push(result.as_resolvable());

        trace!(value_type = type_name::<T>(), "registered eventual result");

        Ok(())
    }

    /// Closes the registry and fails every still-pending registered result with
    /// [`Error::LoopStopped`].
    ///
    /// Meant to run on the event loop thread as part of loop shutdown. Calling it again has no
    /// further effect. Returns the number of results that were unblocked by this call.
    pub fn stop(&self) -> usize {
        let results = {
            let mut state = self.state.lock();
            state.stopped = true;
            mem::take(&mut state.results)
        };

        // Resolving happens outside our lock; each result synchronizes on its own.
        let unblocked = results
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|result| result.resolve_with(Error::LoopStopped))
            .count();

        debug!(unblocked, "result registry stopped");

        unblocked
    }

    /// Returns `true` once [`stop()`][Self::stop] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// The number of registered results that are still alive.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.state
            .lock()
            .results
            .iter()
            .filter(|result| result.strong_count() > 0)
            .count()
    }
}

impl Default for ResultRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResultRegistry {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct(type_name::<Self>())
            .field("stopped", &state.stopped)
            .field("entry_count", &state.results.len())
            .finish_non_exhaustive()
    }
}
