//! Jira operations for jirabee.
//!
//! This crate wraps a ready MCP connection to a Jira tool server (such as
//! `mcp-atlassian`) with typed operations: JQL search, sprint details and
//! board sprints. Tool failures come back as [`JiraOutcome::ToolError`] so
//! callers can report them in their own words.

mod tools;
mod types;

pub use tools::{tool_names, JiraOutcome, JiraTools};
pub use types::*;
