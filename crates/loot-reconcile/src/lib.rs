//! loot-reconcile
//!
//! Repairs drift between an account's snapshot list and its owned item
//! instances.
//!
//! - `engine`: pure planning, no IO
//! - `runner`: reads the store, applies the plan through the batch
//!   mutation primitive, isolates per-account failures
//!
//! Convergence, not correctness: whichever representation the configured
//! [`TrustDirection`] names wins. Locked instances are never removed.

mod engine;
mod runner;
mod types;

pub use engine::plan;
pub use loot_schemas::TrustDirection;
pub use runner::Reconciler;
pub use types::*;
