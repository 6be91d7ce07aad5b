//! Git worktree management for Hive.
//!
//! Every agent works in its own worktree under a shared root, on a branch
//! named `<namespace>/<agent>`.

mod manager;

pub use manager::{RegisteredWorktree, Worktree, WorktreeError, WorktreeManager, validate_name};
