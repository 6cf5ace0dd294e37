//! Typed views of the JSON the Jira tool server returns.
//!
//! Tool servers differ in how much of the Jira REST shape they pass
//! through, so every field beyond the issue key is optional.

use serde::{Deserialize, Serialize};

// =============================================================================
// Issues
// =============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraUser {
    /// Cloud account id
    #[serde(default)]
    pub account_id: Option<String>,
    /// Server/Data Center username
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JiraIssue {
    #[serde(default)]
    pub id: Option<String>,
    /// e.g. "PROJ-123"
    pub key: String,
    #[serde(default)]
    pub fields: JiraIssueFields,
}

impl JiraIssue {
    /// Status category key ("new", "indeterminate", "done"), if present.
    pub fn status_category(&self) -> Option<&str> {
        self.fields
            .status
            .as_ref()
            .and_then(|s| s.status_category.as_ref())
            .map(|c| c.key.as_str())
    }

    pub fn is_done(&self) -> bool {
        self.status_category() == Some("done")
    }

    pub fn is_blocked(&self) -> bool {
        self.fields.labels.iter().any(|l| l.eq_ignore_ascii_case("blocked"))
            || self
                .fields
                .status
                .as_ref()
                .is_some_and(|s| s.name.eq_ignore_ascii_case("blocked"))
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct JiraIssueFields {
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: Option<JiraStatus>,
    #[serde(default)]
    pub priority: Option<JiraPriority>,
    #[serde(default)]
    pub assignee: Option<JiraUser>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraStatus {
    pub name: String,
    #[serde(default)]
    pub status_category: Option<JiraStatusCategory>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JiraStatusCategory {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JiraPriority {
    pub name: String,
}

/// Result of a JQL search.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraSearchResponse {
    #[serde(default)]
    pub issues: Vec<JiraIssue>,
    #[serde(default)]
    pub total: Option<u32>,
    #[serde(default)]
    pub start_at: Option<u32>,
    #[serde(default)]
    pub max_results: Option<u32>,
}

// =============================================================================
// Sprints
// =============================================================================

/// Sprint lifecycle state as the agile API names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SprintState {
    Future,
    Active,
    Closed,
}

impl SprintState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SprintState::Future => "future",
            SprintState::Active => "active",
            SprintState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SprintState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SprintState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "future" => Ok(SprintState::Future),
            "active" => Ok(SprintState::Active),
            "closed" => Ok(SprintState::Closed),
            other => Err(format!(
                "unknown sprint state '{}', expected future, active or closed",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JiraSprint {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: Option<SprintState>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
}

/// Sprint listing. Servers return either a bare array or an agile-API page.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JiraSprintList {
    Page {
        #[serde(alias = "sprints")]
        values: Vec<JiraSprint>,
    },
    Bare(Vec<JiraSprint>),
}

impl JiraSprintList {
    pub fn into_sprints(self) -> Vec<JiraSprint> {
        match self {
            JiraSprintList::Page { values } | JiraSprintList::Bare(values) => values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_issue_status_helpers() {
        let issue: JiraIssue = serde_json::from_value(json!({
            "key": "PROJ-1",
            "fields": {
                "summary": "Fix login",
                "status": {"name": "Done", "statusCategory": {"key": "done"}},
                "labels": []
            }
        }))
        .unwrap();
        assert!(issue.is_done());
        assert!(!issue.is_blocked());

        let blocked: JiraIssue = serde_json::from_value(json!({
            "key": "PROJ-2",
            "fields": {"labels": ["Blocked"]}
        }))
        .unwrap();
        assert!(blocked.is_blocked());
        assert_eq!(blocked.status_category(), None);
    }

    #[test]
    fn test_search_response_tolerates_missing_fields() {
        let response: JiraSearchResponse =
            serde_json::from_value(json!({"issues": [{"key": "PROJ-3"}]})).unwrap();
        assert_eq!(response.issues[0].key, "PROJ-3");
        assert!(response.issues[0].fields.summary.is_none());
        assert!(response.total.is_none());
    }

    #[test]
    fn test_sprint_list_shapes() {
        let page: JiraSprintList = serde_json::from_value(json!({
            "values": [{"id": 7, "name": "Sprint 7", "state": "closed"}]
        }))
        .unwrap();
        let sprints = page.into_sprints();
        assert_eq!(sprints[0].state, Some(SprintState::Closed));

        let bare: JiraSprintList =
            serde_json::from_value(json!([{"id": 8, "name": "Sprint 8"}])).unwrap();
        assert_eq!(bare.into_sprints()[0].id, 8);
    }

    #[test]
    fn test_sprint_state_parse() {
        assert_eq!("Active".parse::<SprintState>().unwrap(), SprintState::Active);
        assert!("open".parse::<SprintState>().is_err());
        assert_eq!(SprintState::Closed.to_string(), "closed");
    }
}
