//! A single-assignment deferred value.
//!
//! A [`Deferred`] starts pending and is settled exactly once, either
//! fulfilled with a value or failed with an error. Observers registered with
//! [`Deferred::on_success`], [`Deferred::on_failure`] or
//! [`Deferred::on_settle`] are called synchronously, in registration order,
//! on the thread that settles it. Observers registered after that are called
//! right away.
//!
//! Nothing here schedules work. [`Deferred::settled`] exposes the outcome as
//! a [`Future`](std::future::Future) for code that wants to `.await` it, and
//! polling that is left to whichever executor the caller uses.
//!
//! # Examples
//!
//! ```
//! use deferred_value::{Deferred, Error};
//!
//! let request = Deferred::<u16, String>::pending();
//! request
//!     .on_success(|status| println!("status {status}"))
//!     .on_failure(|error| println!("failed: {error}"));
//!
//! request.fulfill(200).unwrap();
//! assert_eq!(request.value(), Some(200));
//! assert_eq!(request.fail("too late".into()), Err(Error::AlreadySettled));
//! ```
use std::sync::Arc;

mod deferred;
mod observer;
mod settled;
mod state;

pub use deferred::Deferred;
pub use settled::Settled;
pub use state::State;

/// The default error payload of a [`Deferred`].
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `fulfill` or `fail` was called on a value that had already settled.
    #[error("deferred value was already settled")]
    AlreadySettled,
    /// Every handle to a pending value was dropped, so it can never settle.
    #[error("deferred value was dropped before it settled")]
    Abandoned,
}
