use std::any::{Any, TypeId, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::{Error, EventualResult, Reactor, Result, is_reportable};

static GLOBAL: LazyLock<Arc<ResultStore>> = LazyLock::new(|| Arc::new(ResultStore::new()));

/// An in-memory store that hands out integer handles for [`EventualResult`]s.
///
/// A result can be [stashed][EventualResult::stash] and retrieved later, possibly from another
/// thread, using nothing but the returned handle. This is useful for referring to results from
/// contexts that can only carry a primitive value, such as a web session that starts some work
/// in one request and collects the result in a later one.
///
/// Handles start at 1 and strictly increase for the lifetime of the store. Each stored result
/// can be retrieved exactly once.
///
/// Results that are still in the store when their event loop shuts down are inspected by
/// [`sweep_unretrieved_from()`][Self::sweep_unretrieved_from] and any failures among them are
/// logged. Several event loops may share one store; each only sweeps its own results.
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// use tethered::{Error, EventLoop, ResultStore};
///
/// let store = Arc::new(ResultStore::new());
/// let event_loop = EventLoop::builder()
///     .result_store(Arc::clone(&store))
///     .build();
/// event_loop.start().unwrap();
///
/// let handle = event_loop
///     .run(|| Ok::<_, Infallible>("report.pdf"))
///     .unwrap()
///     .stash()
///     .unwrap();
///
/// // Later, possibly somewhere else entirely:
/// let result = store.retrieve::<&str>(handle).unwrap();
/// assert_eq!(result.wait(Duration::from_secs(10)).unwrap(), "report.pdf");
///
/// // Each handle can only be redeemed once.
/// assert!(matches!(
///     store.retrieve::<&str>(handle),
///     Err(Error::UnknownHandle { .. })
/// ));
/// # event_loop.shutdown();
/// ```
pub struct ResultStore {
    state: Mutex<StoreState>,
}

struct StoreState {
    last_id: u64,
    stored: BTreeMap<u64, Box<dyn StashedResult>>,
}

impl ResultStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                last_id: 0,
                stored: BTreeMap::new(),
            }),
        }
    }

    /// A process-wide store that any event loop can opt into with
    /// [`EventLoopBuilder::result_store()`][crate::EventLoopBuilder::result_store].
    ///
    /// Each event loop uses a store of its own by default.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Stores a result and returns the handle under which it can be retrieved.
    pub fn store<T>(&self, result: EventualResult<T>) -> u64
    where
        T: Send + 'static,
    {
        let mut state = self.state.lock();

        let id = state
            .last_id
            .checked_add(1)
            .expect("result handle space exhausted - impossible with 64-bit handles");
        state.last_id = id;
        state.stored.insert(id, Box::new(result));

        trace!(id, value_type = type_name::<T>(), "stashed eventual result");

        id
    }

    /// Removes the result stored under `id` from the store and returns it.
    ///
    /// # Errors
    ///
    /// * [`Error::UnknownHandle`] if nothing is stored under `id`, either because it was never
    ///   stored or because it has already been retrieved.
    /// * [`Error::HandleTypeMismatch`] if the stored result holds a value type other than `T`.
    ///   The result stays in the store.
    pub fn retrieve<T>(&self, id: u64) -> Result<EventualResult<T>>
    where
        T: Send + 'static,
    {
        let mut state = self.state.lock();

        match state.stored.get(&id) {
            None => return Err(Error::UnknownHandle { id }),
            Some(stored) if stored.value_type() != TypeId::of::<T>() => {
                return Err(Error::HandleTypeMismatch { id });
            }
            Some(_) => {}
        }

        let stored = state
            .stored
            .remove(&id)
            .ok_or(Error::UnknownHandle { id })?;
        drop(state);

        trace!(id, value_type = type_name::<T>(), "retrieved eventual result");

        stored
            .into_any()
            .downcast::<EventualResult<T>>()
            .map(|result| *result)
            .map_err(|_mismatched| Error::HandleTypeMismatch { id })
    }

    /// Empties the store, logging every failure among the results that were never retrieved.
    ///
    /// Meant for the owner of the store when it is done with it, so that errors in results
    /// nobody came back for (e.g. from an abandoned web session) are not silently lost. Each
    /// logged failure counts as retrieved, so it is not logged a second time when the result is
    /// dropped.
    ///
    /// Returns the number of failures logged.
    pub fn sweep_unretrieved(&self) -> usize {
        let stored = mem::take(&mut self.state.lock().stored);

        log_unretrieved_failures(stored)
    }

    /// Like [`sweep_unretrieved()`][Self::sweep_unretrieved] but only removes the results of work
    /// driven by `reactor`. Results of other event loops stay in the store.
    ///
    /// Returns the number of failures logged.
    pub fn sweep_unretrieved_from(&self, reactor: &Arc<dyn Reactor>) -> usize {
        let swept = {
            let mut state = self.state.lock();

            let (swept, kept): (BTreeMap<_, _>, BTreeMap<_, _>) = mem::take(&mut state.stored)
                .into_iter()
                .partition(|(_, result)| result.is_driven_by(reactor));

            state.stored = kept;
            swept
        };

        log_unretrieved_failures(swept)
    }

    /// The number of results currently in the store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().stored.len()
    }

    /// Returns `true` if no results are in the store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().stored.is_empty()
    }
}

impl Default for ResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResultStore {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct(type_name::<Self>())
            .field("last_id", &state.last_id)
            .field("stored_count", &state.stored.len())
            .finish()
    }
}

fn log_unretrieved_failures(stored: BTreeMap<u64, Box<dyn StashedResult>>) -> usize {
    let swept = stored.len();

    let mut logged: usize = 0;

    for (id, result) in stored {
        if let Some(error) = result.peek_failure() {
            if is_reportable(&error) {
                error!(handle = id, error = %error, "unretrieved eventual result failed");
                logged = logged.saturating_add(1);
            }
        }
    }

    debug!(swept, logged, "swept unretrieved eventual results");

    logged
}

/// Type-erased view of a stored result.
trait StashedResult: Send {
    fn value_type(&self) -> TypeId;

    fn peek_failure(&self) -> Option<Error>;

    fn is_driven_by(&self, reactor: &Arc<dyn Reactor>) -> bool;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> StashedResult for EventualResult<T>
where
    T: Send + 'static,
{
    fn value_type(&self) -> TypeId {
        TypeId::of::<T>()
    }

    fn peek_failure(&self) -> Option<Error> {
        Self::peek_failure(self)
    }

    fn is_driven_by(&self, reactor: &Arc<dyn Reactor>) -> bool {
        Self::is_driven_by(self, reactor)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
