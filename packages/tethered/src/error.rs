use thiserror::Error;

use crate::Failure;

/// Errors returned by the operations of this crate.
///
/// Waiting on an [`EventualResult`][crate::EventualResult] yields one of the "outcome" variants:
/// [`TimedOut`][Self::TimedOut] if no result arrived in time, or the terminal failure of the
/// result ([`Failed`][Self::Failed], [`LoopStopped`][Self::LoopStopped] or
/// [`Cancelled`][Self::Cancelled]). The remaining variants signal misuse of the API.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No result became available before the timeout elapsed.
    ///
    /// This is not terminal: waiting again may still observe a result.
    #[error("timed out waiting for the result")]
    TimedOut,

    /// The event loop stopped before a result became available, so none ever will.
    #[error("the event loop stopped before a result became available")]
    LoopStopped,

    /// The operation was cancelled before it produced a result.
    #[error("the operation was cancelled")]
    Cancelled,

    /// The work itself failed. The original error is carried unchanged.
    #[error("the operation failed: {0}")]
    Failed(Failure),

    /// A result was registered after the event loop had already stopped.
    #[error("cannot schedule work because the event loop has stopped")]
    RegistryClosed,

    /// No result is stored under the handle, either because it was never stored or because it
    /// was already retrieved.
    #[error("no stashed result exists for handle {id}")]
    UnknownHandle {
        /// The handle that was looked up.
        id: u64,
    },

    /// A stored result exists for the handle but it holds a different value type than the
    /// caller asked for. The stored result stays in the store.
    #[error("the stashed result for handle {id} holds a different value type")]
    HandleTypeMismatch {
        /// The handle that was looked up.
        id: u64,
    },

    /// The result was stashed after every owner of its [`ResultStore`][crate::ResultStore] had
    /// dropped it, typically because the event loop that created the result is gone.
    #[error("cannot stash the result because its result store no longer exists")]
    StoreDropped,

    /// Blocking on a result from the event loop thread would deadlock the loop.
    #[error("waiting for a result must not be done on the event loop thread")]
    WaitOnLoopThread,

    /// Work was scheduled before `start()` or `start_passive()` was called.
    #[error("the event loop has not been started")]
    NotStarted,

    /// `start_passive()` was called after `start()`.
    #[error("the event loop was already started in running mode")]
    AlreadyStarted,

    /// `start()` was called after `start_passive()`.
    #[error("the event loop was already started in passive mode")]
    AlreadyPassive,
}

impl Error {
    /// Returns `true` if this is a terminal outcome of an eventual result rather than a timeout
    /// or a usage error.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::LoopStopped | Self::Cancelled)
    }

    /// Returns the failure of the work itself, if that is what this error represents.
    #[must_use]
    pub fn as_failure(&self) -> Option<&Failure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Self::Failed(failure)
    }
}

/// A specialized `Result` type for operations of this crate, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
