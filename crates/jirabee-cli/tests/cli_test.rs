//! Integration tests for the `jirabee` binary.
//!
//! Each test runs the real binary with a cleared environment, a temporary
//! settings file and `--no-keychain`, so nothing on the host leaks in.
//! Tool servers are played by an httpmock server speaking MCP over HTTP.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config_path(&self) -> PathBuf {
        self.dir.path().join("config.toml")
    }

    fn jirabee(&self) -> Command {
        jirabee_with_config(&self.config_path(), self.dir.path())
    }
}

fn jirabee_with_config(config: &Path, home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_jirabee"));
    cmd.env_clear()
        .env("HOME", home)
        .arg("--no-keychain")
        .arg("--config")
        .arg(config);
    cmd
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// Mocks the handshake of an MCP server that offers `list_items` and `search_issues`.
fn mock_handshake(server: &MockServer) {
    server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .header("authorization", "Bearer secret-token")
            .body_includes("\"method\":\"initialize\"");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "mock-atlassian", "version": "0.11.0"}
            }
        }));
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .body_includes("\"method\":\"notifications/initialized\"");
        then.status(202);
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .body_includes("\"method\":\"tools/list\"");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"tools": [
                {"name": "list_items", "description": "List items\nwith details"},
                {"name": "search_issues", "description": "Search issues with JQL",
                 "inputSchema": {"type": "object", "properties": {"jql": {"type": "string"}}}}
            ]}
        }));
    });
}

// =============================================================================
// config
// =============================================================================

#[test]
fn test_config_set_get_show() {
    let sandbox = Sandbox::new();

    let output = sandbox
        .jirabee()
        .args(["config", "set", "jira.url", "https://example.atlassian.net"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = sandbox
        .jirabee()
        .args(["config", "set", "jira.board", "42"])
        .output()
        .unwrap();
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let output = sandbox
        .jirabee()
        .args(["config", "get", "jira.url"])
        .output()
        .unwrap();
    assert_eq!(stdout(&output).trim(), "https://example.atlassian.net");

    let output = sandbox.jirabee().args(["config", "show"]).output().unwrap();
    let shown = stdout(&output);
    assert!(shown.contains("[jira]"), "{}", shown);
    assert!(shown.contains("board_id = \"42\""), "{}", shown);
}

#[test]
fn test_config_path() {
    let sandbox = Sandbox::new();
    let output = sandbox.jirabee().args(["config", "path"]).output().unwrap();
    assert_eq!(stdout(&output).trim(), sandbox.config_path().display().to_string());
}

#[test]
fn test_config_unknown_key_fails() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .args(["config", "set", "jira.colour", "blue"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Unknown jira config field: colour"));
}

#[test]
fn test_config_get_unset_value_fails() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .args(["config", "get", "server.url"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("server.url is not set"));
}

// =============================================================================
// Configuration errors name the field and never reach a server
// =============================================================================

#[test]
fn test_missing_target_is_reported() {
    let sandbox = Sandbox::new();
    let output = sandbox.jirabee().arg("tools").output().unwrap();

    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("`target` is required"), "{}", err);
    assert!(err.contains("hint:"), "{}", err);
}

#[test]
fn test_missing_credential_is_reported() {
    let server = MockServer::start();
    let any_request = server.mock(|when, then| {
        when.path("/mcp");
        then.status(500);
    });

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .arg("tools")
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("`credential` is required"));
    any_request.assert_hits(0);
}

#[test]
fn test_call_rejects_non_object_arguments() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .args(["call", "list_items", "--args", "[1, 2]"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("`arguments` must be a JSON object"));
}

// =============================================================================
// Talking to a server
// =============================================================================

#[test]
fn test_tools_lists_server_tools() {
    let server = MockServer::start();
    mock_handshake(&server);

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .env("JIRA_TOKEN", "secret-token")
        .arg("tools")
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let listed = stdout(&output);
    assert!(listed.contains("list_items"));
    assert!(listed.contains("List items"));
    assert!(!listed.contains("with details"));
    assert!(listed.contains("search_issues"));
}

#[test]
fn test_call_prints_result_unmodified() {
    let server = MockServer::start();
    mock_handshake(&server);
    let call = server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .body_includes("\"method\":\"tools/call\"")
            .body_includes("\"name\":\"list_items\"");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [{"id": "X1"}], "isError": false}
        }));
    });

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .env("JIRA_TOKEN", "secret-token")
        .args(["call", "list_items"])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let printed: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(printed, json!({"content": [{"id": "X1"}], "isError": false}));
    call.assert();
}

#[test]
fn test_call_remote_error_exits_nonzero() {
    let server = MockServer::start();
    mock_handshake(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .body_includes("\"method\":\"tools/call\"");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {
                "content": [{"type": "text", "text": "Error in the JQL Query"}],
                "isError": true
            }
        }));
    });

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .env("JIRA_TOKEN", "secret-token")
        .args(["call", "search_issues", "--args", r#"{"jql": "project = "}"#])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stdout(&output).contains("Error in the JQL Query"));
    assert!(stderr(&output).contains("the tool reported a failure"));
}

#[test]
fn test_call_unknown_tool_is_not_sent() {
    let server = MockServer::start();
    mock_handshake(&server);
    let call = server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .body_includes("\"method\":\"tools/call\"");
        then.status(500);
    });

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .env("JIRA_TOKEN", "secret-token")
        .args(["call", "delete_project"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Unknown tool"));
    call.assert_hits(0);
}

#[test]
fn test_search_uses_jira_tool() {
    let server = MockServer::start();
    mock_handshake(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/mcp")
            .body_includes("\"name\":\"search_issues\"")
            .body_includes("sprint in openSprints()");
        then.status(200).json_body(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "result": {"content": [
                {"type": "text", "text": "{\"issues\": [{\"key\": \"PROJ-1\"}], \"total\": 1}"}
            ]}
        }));
    });

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .env("JIRA_TOKEN", "secret-token")
        .args(["search", "sprint in openSprints()"])
        .output()
        .unwrap();

    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let printed: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(printed["issues"][0]["key"], "PROJ-1");
}

#[test]
fn test_rejected_credential_is_auth_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/mcp");
        then.status(401).body("Unauthorized");
    });

    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_URL", server.url("/mcp"))
        .env("JIRA_TOKEN", "expired-token")
        .arg("ping")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("Authentication error"), "{}", err);
    assert!(err.contains("jirabee login"), "{}", err);
}

#[test]
fn test_unreachable_server_is_transport_error() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .env("JIRABEE_MCP_COMMAND", "jirabee-no-such-server --stdio")
        .env("JIRA_TOKEN", "secret-token")
        .arg("ping")
        .output()
        .unwrap();

    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("Transport error"), "{}", err);
    assert!(err.contains("jirabee-no-such-server"), "{}", err);
}

#[test]
fn test_login_respects_no_keychain() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .jirabee()
        .args(["login", "--token", "abc"])
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(stderr(&output).contains("--no-keychain"));
}
