#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Blocking, timeout-aware access to the results of work that runs on a single event loop
//! thread.
//!
//! Some libraries insist that all of their work happens on one event loop thread. This crate
//! lets ordinary blocking threads hand closures to that thread and wait for the outcome.
//!
//! # Quick start
//!
//! ```rust
//! use std::time::Duration;
//!
//! use tethered::{EventLoop, Failure};
//!
//! let event_loop = EventLoop::new();
//! event_loop.start().unwrap();
//!
//! // Submit work and keep a handle to its eventual result.
//! let result = event_loop.run(|| Ok::<_, Failure>("computed on the loop")).unwrap();
//!
//! // Block this thread until the result is available, giving up after a while.
//! assert_eq!(
//!     result.wait(Duration::from_secs(10)).unwrap(),
//!     "computed on the loop"
//! );
//!
//! // Asynchronous work is driven to completion on the loop thread.
//! let value = event_loop
//!     .wait_for_async(
//!         async || {
//!             tokio::time::sleep(Duration::from_millis(1)).await;
//!             Ok::<_, Failure>(42)
//!         },
//!         Duration::from_secs(10),
//!     )
//!     .unwrap();
//! assert_eq!(value, 42);
//!
//! event_loop.shutdown();
//! ```
//!
//! # Key features
//!
//! - **Blocking with timeouts**: [`EventualResult::wait()`] blocks for at most the given
//!   duration and returns [`Error::TimedOut`] without disturbing the result, so waiting again
//!   later still works.
//! - **Never blocked forever**: when the event loop stops, every result still pending fails with
//!   [`Error::LoopStopped`].
//! - **Cancellation**: [`EventualResult::cancel()`] asks the loop thread to abort the work.
//! - **Handles**: [`EventualResult::stash()`] turns a result into an integer that can be redeemed
//!   later through the [`ResultStore`], for example from a different web request.
//! - **No lost errors**: failures nobody looked at are logged through `tracing` when the last
//!   handle is dropped or when the process shuts down.
//!
//! # Shutdown behavior
//!
//! [`EventLoop::shutdown()`] stops the loop, fails all pending results with
//! [`Error::LoopStopped`] and logs unretrieved failures from the [`ResultStore`]. The same
//! happens automatically once the thread that started the event loop exits, except when that
//! thread is the main thread, whose exit ends the process without running any cleanup.

mod error;
mod event_loop;
mod eventual_result;
mod failure;
mod reactor;
mod result_registry;
mod result_store;
mod shutdown;
mod tokio_reactor;

#[cfg(test)]
mod test_utils;

pub use error::*;
pub use event_loop::*;
pub use eventual_result::{EventualResult, Resolver};
pub(crate) use eventual_result::{Resolvable, is_reportable};
pub use failure::{Failure, Panicked};
pub(crate) use failure::panic_message;
pub use reactor::*;
pub use result_registry::*;
pub use result_store::*;
pub use shutdown::*;
pub use tokio_reactor::*;
