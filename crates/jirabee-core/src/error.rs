//! Error types for jirabee.
//!
//! Connection-establishment failures (`Config`, `Setting`, `Transport`,
//! `Handshake`, `Auth`) are terminal for the `connect` call that produced
//! them. Per-invocation failures (`NotReady`, `UnknownTool`, `Timeout`,
//! `Closed`) are returned to the caller and leave the process running.
//! Errors reported by the remote tool itself are not errors at this level:
//! they arrive as a `ToolInvocationResult` with `is_error` set.

use std::time::Duration;

use thiserror::Error;

/// Main error type for jirabee operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file could not be read, parsed or written
    #[error("Configuration error: {0}")]
    Config(String),

    /// A connection setting is missing or malformed
    #[error("Configuration error: `{field}` {message}")]
    Setting { field: String, message: String },

    /// The tool server could not be spawned or reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// The tool server rejected or mis-negotiated the protocol handshake
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The tool server rejected the credential
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The connection has not finished its handshake
    #[error("Connection not ready: {0}")]
    NotReady(String),

    /// The requested tool was not advertised by the server
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No response arrived within the allowed time
    #[error("Tool call '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    /// The connection was closed before or while the call was in flight
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Credential storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Build a [`Error::Setting`] for a missing required field.
    pub fn missing(field: impl Into<String>) -> Self {
        Error::Setting {
            field: field.into(),
            message: "is required but was not set".to_string(),
        }
    }

    /// Build a [`Error::Setting`] for a field with an unusable value.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Setting {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error was caused by local configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_) | Error::Setting { .. })
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Retry and backoff are caller policy; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Timeout { .. })
    }

    /// Operator-facing hint for errors that need someone to act.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) | Error::Setting { .. } => Some(
                "check the config file, the JIRA_* / JIRABEE_* environment variables, or the command-line flags",
            ),
            Error::Transport(_) => Some(
                "the tool server is unreachable or failed to start; check the server command or URL",
            ),
            Error::Handshake(_) => Some(
                "the tool server rejected the protocol handshake; check that it speaks a supported MCP version",
            ),
            Error::Auth(_) => Some(
                "the credential was rejected; create a new API token and store it with `jirabee login`",
            ),
            _ => None,
        }
    }
}

/// Result type alias for jirabee operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_names_field() {
        let err = Error::missing("credential");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("`credential`"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Transport("refused".into()).is_retryable());
        assert!(Error::Timeout {
            tool: "search_issues".into(),
            timeout: Duration::from_millis(200),
        }
        .is_retryable());
        assert!(!Error::Auth("401".into()).is_retryable());
        assert!(!Error::Handshake("bad version".into()).is_retryable());
        assert!(!Error::missing("target").is_retryable());
    }

    #[test]
    fn test_remediation_distinguishes_causes() {
        let misconfigured = Error::missing("target").remediation().unwrap();
        let unreachable = Error::Transport("spawn failed".into())
            .remediation()
            .unwrap();
        let rejected = Error::Auth("401".into()).remediation().unwrap();

        assert_ne!(misconfigured, unreachable);
        assert_ne!(unreachable, rejected);
        assert!(rejected.contains("jirabee login"));
        assert!(Error::UnknownTool("x".into()).remediation().is_none());
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            tool: "get_sprint".into(),
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "Tool call 'get_sprint' timed out after 200ms");
    }
}
