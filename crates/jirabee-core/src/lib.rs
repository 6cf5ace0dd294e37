//! Core types, configuration, and error handling for jirabee.
//!
//! This crate provides the foundational abstractions shared by the MCP
//! connection manager, the Jira façade, and the CLI.

pub mod config;
pub mod error;
pub mod tool;
pub mod types;

pub use config::{ConnectionConfig, ServerTarget, Settings};
pub use error::{Error, Result};
pub use tool::AgentTool;
pub use types::{
    ConnectionState, ContentItem, ToolDescriptor, ToolInvocationRequest, ToolInvocationResult,
};
