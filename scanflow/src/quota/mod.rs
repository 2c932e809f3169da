//! Provider call budgets.
//!
//! Fixed-window counters per provider name. A window that has expired is
//! rolled forward by whole periods before any read or write, so a process
//! that sat idle through several windows catches up in one step.

mod guard;
mod state;

pub use guard::{QuotaGuard, RecordedCall};
pub use state::{QuotaSnapshot, QuotaWindow};
