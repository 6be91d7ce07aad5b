//! Hive Hub Library
//!
//! Orchestration engine for worktree-isolated coding agents:
//! - Git worktree isolation per agent
//! - Agent process spawning, liveness and messaging
//! - Task, solicitation and port coordination
//! - REST API and SSE event stream

pub mod agent;
pub mod events;
pub mod hub;
pub mod port;
pub mod server;
pub mod solicitation;
pub mod state;
pub mod task;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod worktree;

pub use hub::{Hub, HubError, ReconcileReport, StatusInfo, TaskAction, TaskUpdate};
