//! Pure logic shared by the pane and loop engines.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod layout;
pub mod types;
pub mod verdict;
