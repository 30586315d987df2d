//! Database query modules.
//!
//! Each module provides async functions that operate on the [`Database`](super::Database).

pub mod decisions;
pub mod messages;

pub use messages::StoreCounts;
