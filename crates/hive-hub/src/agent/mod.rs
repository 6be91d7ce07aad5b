//! Agent lifecycle: spawning, control-endpoint access and the registry.
//!
//! - [`AgentSpawner`] prepares a worktree, leases a control port and starts
//!   the shim/agent chain through a [`ProcessLauncher`].
//! - [`AgentClient`] talks to a running agent's control endpoint.
//! - [`AgentManager`] owns the registry and the state transitions.

mod client;
mod launcher;
mod manager;
pub mod process;
mod spawner;
pub mod workspace;


pub use client::{AgentClient, ClientError};
pub use launcher::{Binaries, LaunchPlan, OsLauncher, ProcessLauncher, resolve_binaries};
pub use manager::{AgentError, AgentManager};
pub use spawner::{AgentSpawner, SpawnError, SpawnOptions, command_chain};
