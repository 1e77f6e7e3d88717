//! Pane orchestration for agent sessions running inside tmux.
//!
//! The crate keeps a registry of the panes it launched, lays them out in
//! tiled windows, and reacts to tmux hooks so the layout survives panes
//! exiting, opening, and windows being resized. On top of that it runs
//! verdict loops: worker threads that launch an agent in a pane, poll the
//! pane until a stable verdict appears, and decide whether to iterate.
//!
//! - **[`core`]**: Pure logic (layout math, verdict extraction, shared types).
//! - **[`io`]**: tmux, subprocesses, persisted state and settings.
//! - **[`registry`]**, **[`tiling`]**, **[`lifecycle`]**: the pane side.
//! - **[`looping`]**, **[`supervisor`]**, **[`watchdog`]**: the loop side.

pub mod breadcrumb;
pub mod core;
pub mod idle;
pub mod ids;
pub mod io;
pub mod lifecycle;
pub mod logging;
pub mod looping;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod sync;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tiling;
pub mod watchdog;
