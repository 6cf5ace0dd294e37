//! The surface an agent framework consumes: a tool with a name, a
//! description, an input schema, and a callable invocation.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::ToolInvocationResult;

/// A tool the orchestrating agent can call.
#[async_trait]
pub trait AgentTool: Send + Sync {
    /// Tool name as advertised by the server.
    fn name(&self) -> &str;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// JSON schema of the accepted arguments.
    fn input_schema(&self) -> &Value;

    /// Invoke the tool.
    ///
    /// Remote tool failures come back as `Ok` with `is_error` set.
    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolInvocationResult>;
}
