//! Hive MCP adapter
//!
//! Exposes a fixed tool vocabulary (agents, messages, tasks, solicitations,
//! ports, status) as newline-delimited JSON-RPC 2.0 on stdio, backed by a
//! hub the adapter starts and owns.

pub mod embed;
pub mod protocol;
pub mod resources;
pub mod server;
pub mod tools;

pub use embed::{EmbedError, EmbeddedHub};
pub use server::McpServer;
