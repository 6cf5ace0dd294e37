//! Typed Jira operations over a ready tool-server connection.

use std::sync::Arc;

use jirabee_core::{Error, Result, ToolInvocationRequest, ToolInvocationResult};
use jirabee_mcp::{ConnectionHandle, ToolConnectionManager};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::types::{JiraSearchResponse, JiraSprint, JiraSprintList, SprintState};

/// Tool names for each operation, in order of preference.
///
/// The first name the server advertises is used, so both the short names
/// and the `jira_`-prefixed names of `mcp-atlassian` work.
pub mod tool_names {
    pub const SEARCH_ISSUES: &[&str] = &["search_issues", "jira_search"];
    pub const GET_SPRINT: &[&str] = &["get_sprint", "jira_get_sprint"];
    pub const GET_BOARD_SPRINTS: &[&str] = &["get_board_sprints", "jira_get_sprints_from_board"];
}

/// Fields requested by the issue queries below.
const ISSUE_FIELDS: &[&str] = &["summary", "status", "assignee", "priority", "labels", "updated"];

/// What a Jira tool call produced.
///
/// A tool failure is an outcome, not an `Err`: the caller decides how to
/// phrase it.
#[derive(Debug, Clone, PartialEq)]
pub enum JiraOutcome {
    Data(Value),
    ToolError(String),
}

impl JiraOutcome {
    /// Classify a raw tool result.
    pub fn from_result(tool: &str, result: ToolInvocationResult) -> Self {
        if result.is_error {
            let message = result.joined_text();
            return JiraOutcome::ToolError(if message.is_empty() {
                format!("Tool '{}' reported an error", tool)
            } else {
                message
            });
        }
        match result.payload() {
            Some(value) => JiraOutcome::Data(value),
            None => JiraOutcome::ToolError(format!("No content returned from tool '{}'", tool)),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, JiraOutcome::ToolError(_))
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            JiraOutcome::Data(value) => Some(value),
            JiraOutcome::ToolError(_) => None,
        }
    }

    /// Deserialize the data, or return the tool's error message.
    pub fn decode<T: DeserializeOwned>(self) -> std::result::Result<T, String> {
        match self {
            JiraOutcome::Data(value) => serde_json::from_value(value)
                .map_err(|e| format!("Unexpected response shape: {}", e)),
            JiraOutcome::ToolError(message) => Err(message),
        }
    }
}

/// Jira operations for one connection.
pub struct JiraTools {
    manager: Arc<ToolConnectionManager>,
    handle: Arc<ConnectionHandle>,
    board_id: Option<String>,
}

impl JiraTools {
    pub fn new(manager: Arc<ToolConnectionManager>, handle: Arc<ConnectionHandle>) -> Self {
        Self {
            manager,
            handle,
            board_id: None,
        }
    }

    /// Board used when an operation is not given one.
    pub fn with_board(mut self, board_id: Option<String>) -> Self {
        self.board_id = board_id.filter(|b| !b.trim().is_empty());
        self
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    /// First advertised name among `candidates`.
    fn resolve(&self, candidates: &[&str]) -> Result<String> {
        candidates
            .iter()
            .find(|name| self.handle.has_capability(name))
            .map(|name| name.to_string())
            .ok_or_else(|| {
                Error::UnknownTool(format!(
                    "'{}' offers none of: {}",
                    self.handle.server(),
                    candidates.join(", ")
                ))
            })
    }

    async fn call(&self, candidates: &[&str], arguments: Value) -> Result<JiraOutcome> {
        let tool = self.resolve(candidates)?;
        let request = ToolInvocationRequest::with_arguments(&tool, arguments)?;
        debug!(tool = %tool, "Calling Jira tool");

        let result = self.manager.invoke(&self.handle, request).await?;
        let outcome = JiraOutcome::from_result(&tool, result);
        if let JiraOutcome::ToolError(message) = &outcome {
            warn!(tool = %tool, error = %message, "Jira tool reported an error");
        }
        Ok(outcome)
    }

    /// Run a JQL query.
    pub async fn search_issues(&self, jql: &str, fields: &[&str]) -> Result<JiraOutcome> {
        self.call(
            tool_names::SEARCH_ISSUES,
            json!({"jql": jql, "fields": fields}),
        )
        .await
    }

    /// Sprint details.
    pub async fn get_sprint(&self, sprint_id: &str) -> Result<JiraOutcome> {
        self.call(tool_names::GET_SPRINT, json!({"sprint_id": sprint_id}))
            .await
    }

    /// Sprints of a board, optionally filtered by state.
    ///
    /// Without `board_id` the configured board is used; with neither, this
    /// is a configuration error naming `board_id`.
    pub async fn get_board_sprints(
        &self,
        board_id: Option<&str>,
        state: Option<SprintState>,
    ) -> Result<JiraOutcome> {
        let board_id = board_id
            .map(str::to_string)
            .or_else(|| self.board_id.clone())
            .ok_or_else(|| Error::missing("board_id"))?;

        let mut arguments = json!({"board_id": board_id});
        if let Some(state) = state {
            arguments["state"] = json!(state.as_str());
        }
        self.call(tool_names::GET_BOARD_SPRINTS, arguments).await
    }

    /// Issues of one sprint.
    pub async fn sprint_issues(&self, sprint_id: &str) -> Result<JiraOutcome> {
        let mut fields = ISSUE_FIELDS.to_vec();
        fields.push("customfield_10016");
        self.search_issues(&format!("sprint = {}", sprint_id), &fields)
            .await
    }

    /// Assigned issues in open sprints.
    pub async fn active_issues(&self) -> Result<JiraOutcome> {
        self.search_issues(
            "sprint in openSprints() AND assignee is not EMPTY",
            ISSUE_FIELDS,
        )
        .await
    }

    /// Blocked issues in open sprints.
    pub async fn blocked_issues(&self) -> Result<JiraOutcome> {
        self.search_issues(
            "sprint in openSprints() AND (status = 'Blocked' OR labels = 'blocked')",
            ISSUE_FIELDS,
        )
        .await
    }

    /// [`search_issues`](Self::search_issues), decoded.
    pub async fn search(&self, jql: &str) -> Result<std::result::Result<JiraSearchResponse, String>> {
        Ok(self.search_issues(jql, ISSUE_FIELDS).await?.decode())
    }

    /// [`get_board_sprints`](Self::get_board_sprints), decoded.
    pub async fn board_sprints(
        &self,
        board_id: Option<&str>,
        state: Option<SprintState>,
    ) -> Result<std::result::Result<Vec<JiraSprint>, String>> {
        let outcome = self.get_board_sprints(board_id, state).await?;
        Ok(outcome.decode::<JiraSprintList>().map(JiraSprintList::into_sprints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jirabee_core::{ConnectionConfig, ContentItem, ServerTarget};
    use jirabee_mcp::testing::{StubConnector, StubReply, StubServer};

    async fn jira(stub: StubServer) -> (JiraTools, StubConnector) {
        let connector = StubConnector::new(stub);
        let manager = Arc::new(ToolConnectionManager::with_connector(Arc::new(
            connector.clone(),
        )));
        let config = ConnectionConfig::new(
            ServerTarget::jira("https://example.atlassian.net", Some("me@example.com")),
            "api-token",
        );
        let handle = manager.connect(&config).await.unwrap();
        (JiraTools::new(manager, handle), connector)
    }

    fn atlassian_stub() -> StubServer {
        StubServer::new()
            .tool("search_issues", "Search issues using JQL")
            .tool("get_sprint", "Get sprint details")
            .tool("get_board_sprints", "List sprints of a board")
    }

    #[test]
    fn test_outcome_classification() {
        let data = JiraOutcome::from_result("t", ToolInvocationResult::text(r#"{"total": 0}"#));
        assert_eq!(data, JiraOutcome::Data(json!({"total": 0})));

        let plain = JiraOutcome::from_result("t", ToolInvocationResult::text("Sprint not found"));
        assert_eq!(plain.data().unwrap()["text_content"], "Sprint not found");

        let failed = JiraOutcome::from_result("t", ToolInvocationResult::error("boom"));
        assert_eq!(failed, JiraOutcome::ToolError("boom".into()));

        let empty = JiraOutcome::from_result("get_sprint", ToolInvocationResult::default());
        assert_eq!(
            empty,
            JiraOutcome::ToolError("No content returned from tool 'get_sprint'".into())
        );

        let silent_error = ToolInvocationResult {
            content: vec![ContentItem::new(json!({"type": "image"}))],
            is_error: true,
        };
        assert!(JiraOutcome::from_result("t", silent_error).is_error());
    }

    #[tokio::test]
    async fn test_search_issues_sends_jql_and_fields() {
        let (jira, connector) = jira(atlassian_stub()).await;

        let outcome = jira
            .search_issues("project = PROJ", &["summary", "status"])
            .await
            .unwrap();

        // The stub echoes arguments back as the payload.
        assert_eq!(
            outcome,
            JiraOutcome::Data(json!({"jql": "project = PROJ", "fields": ["summary", "status"]}))
        );
        let call = connector
            .last_log()
            .unwrap()
            .wait_for_method("tools/call")
            .await;
        assert_eq!(call["params"]["name"], "search_issues");
    }

    #[tokio::test]
    async fn test_prefixed_tool_names_are_used() {
        let (jira, connector) = jira(StubServer::new().tool("jira_search", "")).await;

        jira.active_issues().await.unwrap();

        let call = connector
            .last_log()
            .unwrap()
            .wait_for_method("tools/call")
            .await;
        assert_eq!(call["params"]["name"], "jira_search");
        assert_eq!(
            call["params"]["arguments"]["jql"],
            "sprint in openSprints() AND assignee is not EMPTY"
        );
    }

    #[tokio::test]
    async fn test_missing_tool_is_unknown_tool() {
        let (jira, _connector) = jira(StubServer::new().tool("search_issues", "")).await;
        let err = jira.get_sprint("7").await.unwrap_err();
        assert!(matches!(err, Error::UnknownTool(ref m) if m.contains("get_sprint")));
    }

    #[tokio::test]
    async fn test_board_sprints_use_configured_board() {
        let (jira, _connector) = jira(atlassian_stub()).await;
        let jira = jira.with_board(Some("42".into()));

        let outcome = jira
            .get_board_sprints(None, Some(SprintState::Closed))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JiraOutcome::Data(json!({"board_id": "42", "state": "closed"}))
        );

        let outcome = jira.get_board_sprints(Some("7"), None).await.unwrap();
        assert_eq!(outcome, JiraOutcome::Data(json!({"board_id": "7"})));
    }

    #[tokio::test]
    async fn test_board_sprints_without_board_is_configuration_error() {
        let (jira, connector) = jira(atlassian_stub()).await;

        let err = jira.get_board_sprints(None, None).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("board_id"));

        let methods = connector.last_log().unwrap().methods().await;
        assert!(!methods.iter().any(|m| m == "tools/call"));
    }

    #[tokio::test]
    async fn test_decoded_board_sprints() {
        let page = json!({"values": [
            {"id": 7, "name": "Sprint 7", "state": "closed"},
            {"id": 8, "name": "Sprint 8", "state": "closed"}
        ]});
        let (jira, _connector) = jira(atlassian_stub().reply(
            "get_board_sprints",
            StubReply::Result(ToolInvocationResult::text(page.to_string())),
        ))
        .await;

        let sprints = jira
            .board_sprints(Some("1"), Some(SprintState::Closed))
            .await
            .unwrap()
            .unwrap();
        let names: Vec<_> = sprints.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Sprint 7", "Sprint 8"]);
    }

    #[tokio::test]
    async fn test_tool_error_is_an_outcome() {
        let (jira, _connector) = jira(atlassian_stub().reply(
            "search_issues",
            StubReply::Result(ToolInvocationResult::error("Error in the JQL Query")),
        ))
        .await;

        let decoded = jira.search("project = ").await.unwrap();
        assert_eq!(decoded.unwrap_err(), "Error in the JQL Query");
        assert!(jira.handle().is_ready());
    }

    #[tokio::test]
    async fn test_sprint_issues_query() {
        let (jira, connector) = jira(atlassian_stub()).await;

        jira.sprint_issues("12").await.unwrap();

        let call = connector
            .last_log()
            .unwrap()
            .wait_for_method("tools/call")
            .await;
        assert_eq!(call["params"]["arguments"]["jql"], "sprint = 12");
        let fields = call["params"]["arguments"]["fields"].as_array().unwrap();
        assert!(fields.contains(&json!("customfield_10016")));
    }

    #[tokio::test]
    async fn test_blocked_issues_decode() {
        let response = json!({"issues": [
            {"key": "PROJ-9", "fields": {"labels": ["blocked"], "summary": "Waiting on API"}}
        ], "total": 1});
        let (jira, _connector) = jira(atlassian_stub().reply(
            "search_issues",
            StubReply::Result(ToolInvocationResult::text(response.to_string())),
        ))
        .await;

        let decoded: JiraSearchResponse = jira.blocked_issues().await.unwrap().decode().unwrap();
        assert_eq!(decoded.total, Some(1));
        assert!(decoded.issues[0].is_blocked());
    }
}
