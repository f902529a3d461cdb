//! loot-testkit
//!
//! Test-only building blocks shared by the cross-crate scenarios under
//! `tests/`: a fault-injecting [`Store`](loot_db::Store) wrapper, a claim
//! engine harness on a manual clock, and an in-process gateway transport.

mod faulty_store;
mod harness;

pub use faulty_store::{Fault, FaultyStore, StoreCall};
pub use harness::{card_reward, Harness, LocalTransport, SESSION};
