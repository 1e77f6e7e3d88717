//! I/O helpers: tmux, subprocesses, persisted state and settings.

pub mod config;
pub mod process;
pub mod store;
pub mod tmux;
