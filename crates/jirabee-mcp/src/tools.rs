//! Adapter exposing discovered MCP tools through [`AgentTool`].
//!
//! An agent framework sees a name, a description, a schema and a call. The
//! call always goes through the manager, so capability and state checks
//! apply exactly as for direct invocations.

use std::sync::Arc;

use async_trait::async_trait;
use jirabee_core::{AgentTool, Result, ToolDescriptor, ToolInvocationRequest, ToolInvocationResult};
use serde_json::{Map, Value};

use crate::manager::{ConnectionHandle, ToolConnectionManager};

/// One capability of a ready connection, usable as an agent tool.
pub struct McpTool {
    descriptor: ToolDescriptor,
    manager: Arc<ToolConnectionManager>,
    handle: Arc<ConnectionHandle>,
}

impl McpTool {
    pub fn new(
        descriptor: ToolDescriptor,
        manager: Arc<ToolConnectionManager>,
        handle: Arc<ConnectionHandle>,
    ) -> Self {
        Self {
            descriptor,
            manager,
            handle,
        }
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl AgentTool for McpTool {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn description(&self) -> &str {
        &self.descriptor.description
    }

    fn input_schema(&self) -> &Value {
        &self.descriptor.input_schema
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<ToolInvocationResult> {
        let request = ToolInvocationRequest {
            tool_name: self.descriptor.name.clone(),
            arguments,
        };
        self.manager.invoke(&self.handle, request).await
    }
}

/// One [`McpTool`] per tool the handle discovered.
pub fn tools_for(
    manager: &Arc<ToolConnectionManager>,
    handle: &Arc<ConnectionHandle>,
) -> Vec<Arc<dyn AgentTool>> {
    handle
        .tools()
        .iter()
        .map(|descriptor| {
            Arc::new(McpTool::new(descriptor.clone(), manager.clone(), handle.clone()))
                as Arc<dyn AgentTool>
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubConnector, StubReply, StubServer};
    use jirabee_core::{ConnectionConfig, Error, ServerTarget};
    use serde_json::json;

    async fn connected(stub: StubServer) -> (Arc<ToolConnectionManager>, Arc<ConnectionHandle>) {
        let manager = Arc::new(ToolConnectionManager::with_connector(Arc::new(
            StubConnector::new(stub),
        )));
        let config = ConnectionConfig::new(ServerTarget::command("stub", vec![]), "token");
        let handle = manager.connect(&config).await.unwrap();
        (manager, handle)
    }

    #[tokio::test]
    async fn test_one_tool_per_capability() {
        let (manager, handle) = connected(
            StubServer::new()
                .tool("search_issues", "Search issues with JQL")
                .tool("get_sprint", "Get a sprint"),
        )
        .await;

        let tools = tools_for(&manager, &handle);
        let names: Vec<_> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["search_issues", "get_sprint"]);
        assert_eq!(tools[0].description(), "Search issues with JQL");
        assert_eq!(tools[0].input_schema()["type"], "object");
    }

    #[tokio::test]
    async fn test_call_goes_through_manager() {
        let (manager, handle) = connected(StubServer::new().tool("get_sprint", "")).await;
        let tools = tools_for(&manager, &handle);

        let mut arguments = Map::new();
        arguments.insert("sprint_id".into(), json!("42"));
        let result = tools[0].call(arguments).await.unwrap();
        assert_eq!(result.payload().unwrap(), json!({"sprint_id": "42"}));

        manager.close(&handle).await;
        let err = tools[0].call(Map::new()).await.unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[tokio::test]
    async fn test_remote_error_passes_through() {
        let (manager, handle) = connected(StubServer::new().tool("get_sprint", "").reply(
            "get_sprint",
            StubReply::Result(ToolInvocationResult::error("Sprint 99 does not exist")),
        ))
        .await;

        let tool = &tools_for(&manager, &handle)[0];
        let result = tool.call(Map::new()).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.joined_text(), "Sprint 99 does not exist");
    }
}
