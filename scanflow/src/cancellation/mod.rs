//! Cooperative cancellation.
//!
//! A single root [`CancellationToken`] is owned by the application context;
//! long-lived components take child tokens so they can be stopped on their
//! own while still following a global shutdown.

mod token;

pub use token::CancellationToken;
