use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// The error produced by a unit of work that ran on the event loop thread.
///
/// A `Failure` carries the original error value unchanged. It is cheap to clone, so every thread
/// that waits on the same [`EventualResult`][crate::EventualResult] observes the same failure.
///
/// Any type implementing [`std::error::Error`] converts into a `Failure`, which means work can
/// use `?` on its own error types. Use [`downcast_ref()`][Self::downcast_ref] to recover the
/// original error.
///
/// # Example
///
/// ```
/// use std::io;
///
/// use tethered::Failure;
///
/// let failure = Failure::from(io::Error::new(io::ErrorKind::NotFound, "no such thing"));
///
/// let original = failure.downcast_ref::<io::Error>().unwrap();
/// assert_eq!(original.kind(), io::ErrorKind::NotFound);
/// ```
#[derive(Clone)]
pub struct Failure {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl Failure {
    /// Wraps an error value.
    #[must_use]
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(error),
        }
    }

    /// Creates a failure that carries only a human-readable message.
    #[must_use]
    pub fn msg(message: impl fmt::Display) -> Self {
        Self::new(MessageFailure(message.to_string()))
    }

    /// Creates a failure from a panic payload captured with `catch_unwind`.
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(Panicked {
            message: panic_message(payload),
        })
    }

    /// Returns a reference to the original error if it is of type `E`.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }

    /// Returns `true` if the original error is of type `E`.
    #[must_use]
    pub fn is<E>(&self) -> bool
    where
        E: StdError + 'static,
    {
        self.inner.is::<E>()
    }

    /// Returns `true` if the work panicked instead of returning an error.
    #[must_use]
    pub fn is_panic(&self) -> bool {
        self.is::<Panicked>()
    }

    /// Returns `true` if both values refer to the very same failure instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

// Failure deliberately does not implement std::error::Error itself, otherwise this blanket
// conversion would overlap with the reflexive `From<T> for T`.
impl<E> From<E> for Failure
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl AsRef<dyn StdError + Send + Sync + 'static> for Failure {
    fn as_ref(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.inner
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

/// The work scheduled on the event loop thread panicked.
///
/// Found inside a [`Failure`] for which [`Failure::is_panic()`] returns `true`.
#[derive(Clone, Debug, Error)]
#[error("work panicked on the event loop thread: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    /// The panic message, if the payload was a string. Otherwise a placeholder.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct MessageFailure(String);

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
