//! Hive Core Library
//!
//! Shared functionality for Hive components:
//! - Agent records exchanged between the hub, the MCP adapter and the CLI cache
//! - Configuration resolution and hierarchy
//! - Error taxonomy shared by every domain error
//! - Tracing initialisation

pub mod cache;
pub mod config;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod models;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use models::{Agent, AgentStatus, Message, short_id, unix_timestamp};
