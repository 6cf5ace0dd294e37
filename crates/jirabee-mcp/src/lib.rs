//! MCP (Model Context Protocol) client for jirabee.
//!
//! This crate connects to external tool servers (such as `mcp-atlassian`),
//! performs the MCP handshake, and exposes the discovered tools through
//! [`ToolConnectionManager`]. Raw transports never leave the crate; callers
//! only ever hold a post-handshake [`ConnectionHandle`].

pub mod http;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use manager::{ConnectionHandle, HandleGuard, ToolConnectionManager};
pub use tools::{tools_for, McpTool};
pub use transport::{Connector, DefaultConnector};
