//! Configuration management for jirabee.
//!
//! Two layers:
//!
//! - [`Settings`]: the persisted TOML file, stored in a platform-specific
//!   location (`~/.config/jirabee/config.toml` on Linux,
//!   `~/Library/Application Support/jirabee/config.toml` on macOS,
//!   `%APPDATA%\jirabee\config.toml` on Windows).
//! - [`ConnectionConfig`]: what a connection actually needs, resolved from
//!   the settings file overlaid with process environment variables.
//!
//! The credential is never read from the settings file and never defaulted.
//! It comes from `JIRA_TOKEN`, the OS keychain, or an explicit flag, and is
//! only checked when a connection is attempted.
//!
//! # Example
//!
//! ```ignore
//! use jirabee_core::config::{ConnectionConfig, Settings};
//!
//! let settings = Settings::load()?;
//! let config = ConnectionConfig::from_env(&settings)?;
//! config.validate()?;
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Config file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config directory name.
const CONFIG_DIR_NAME: &str = "jirabee";

/// Per-request timeout used when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Environment variable through which a spawned server receives the credential.
pub const DEFAULT_CREDENTIAL_ENV: &str = "JIRA_API_TOKEN";

/// Launcher and package of the default Jira tool server.
pub const DEFAULT_JIRA_LAUNCHER: &str = "uvx";
pub const DEFAULT_JIRA_SERVER: &str = "mcp-atlassian";

/// Environment variables read by [`ConnectionConfig::from_env`].
pub mod env {
    pub const JIRA_URL: &str = "JIRA_URL";
    pub const JIRA_USERNAME: &str = "JIRA_USERNAME";
    pub const JIRA_TOKEN: &str = "JIRA_TOKEN";
    pub const JIRA_BOARD_ID: &str = "JIRA_BOARD_ID";
    pub const JIRA_PROJECT_KEY: &str = "JIRA_PROJECT_KEY";
    /// Full server command line, split on whitespace.
    pub const MCP_COMMAND: &str = "JIRABEE_MCP_COMMAND";
    pub const MCP_URL: &str = "JIRABEE_MCP_URL";
    pub const TIMEOUT_SECS: &str = "JIRABEE_TIMEOUT_SECS";
}

// =============================================================================
// Persisted settings
// =============================================================================

/// Contents of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Jira instance and scoping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jira: Option<JiraSettings>,

    /// Tool server launch/dial settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerSettings>,
}

/// Jira instance settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JiraSettings {
    /// Jira instance URL
    pub url: String,
    /// Account the API token belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Default board for board-scoped queries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub board_id: Option<String>,
    /// Project key (e.g., "PROJ")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
}

/// Tool server settings. `url` wins over `command` when both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Program to spawn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments passed to `command`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// HTTP endpoint of an already-running server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Per-request timeout in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Environment variable that carries the credential to a spawned server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
}

impl Settings {
    /// Get the configuration directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join(CONFIG_DIR_NAME))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Load settings from the default location.
    ///
    /// Returns default (empty) settings if the file doesn't exist.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load settings from a specific path.
    ///
    /// Returns default (empty) settings if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = ?path, "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        debug!(path = ?path, "Loading config");

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let settings: Settings = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        info!(path = ?path, "Config loaded successfully");
        Ok(settings)
    }

    /// Save settings to the default location.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        debug!(path = ?path, "Saving config");

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        info!(path = ?path, "Config saved successfully");
        Ok(())
    }

    /// Set a value by key path.
    ///
    /// Key format: `section.field` (e.g., `jira.url`, `server.command`).
    /// `server.args` takes a whitespace-separated list.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let (section, field) = split_key(key)?;

        match section {
            "jira" => {
                let jira = self.jira.get_or_insert_with(JiraSettings::default);
                match field {
                    "url" => jira.url = value.to_string(),
                    "username" | "user" => jira.username = Some(value.to_string()),
                    "board_id" | "board" => jira.board_id = Some(value.to_string()),
                    "project_key" | "project" => jira.project_key = Some(value.to_string()),
                    _ => {
                        return Err(Error::Config(format!(
                            "Unknown jira config field: {}",
                            field
                        )))
                    }
                }
            }
            "server" => {
                let server = self.server.get_or_insert_with(ServerSettings::default);
                match field {
                    "command" => server.command = Some(value.to_string()),
                    "args" => {
                        server.args = value.split_whitespace().map(str::to_string).collect()
                    }
                    "url" => server.url = Some(value.to_string()),
                    "timeout_secs" | "timeout" => {
                        let secs = value.parse::<u64>().map_err(|_| {
                            Error::Config(format!(
                                "Invalid timeout '{}': expected a whole number of seconds",
                                value
                            ))
                        })?;
                        server.timeout_secs = Some(secs);
                    }
                    "credential_env" => server.credential_env = Some(value.to_string()),
                    _ => {
                        return Err(Error::Config(format!(
                            "Unknown server config field: {}",
                            field
                        )))
                    }
                }
            }
            _ => {
                return Err(Error::Config(format!("Unknown config section: {}", section)));
            }
        }

        Ok(())
    }

    /// Get a value by key path. Returns `Ok(None)` for unset values.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let (section, field) = split_key(key)?;

        match section {
            "jira" => {
                let Some(jira) = &self.jira else {
                    return Ok(None);
                };
                match field {
                    "url" => Ok(Some(jira.url.clone()).filter(|u| !u.is_empty())),
                    "username" | "user" => Ok(jira.username.clone()),
                    "board_id" | "board" => Ok(jira.board_id.clone()),
                    "project_key" | "project" => Ok(jira.project_key.clone()),
                    _ => Err(Error::Config(format!(
                        "Unknown jira config field: {}",
                        field
                    ))),
                }
            }
            "server" => {
                let Some(server) = &self.server else {
                    return Ok(None);
                };
                match field {
                    "command" => Ok(server.command.clone()),
                    "args" => Ok(Some(server.args.join(" ")).filter(|a| !a.is_empty())),
                    "url" => Ok(server.url.clone()),
                    "timeout_secs" | "timeout" => Ok(server.timeout_secs.map(|t| t.to_string())),
                    "credential_env" => Ok(server.credential_env.clone()),
                    _ => Err(Error::Config(format!(
                        "Unknown server config field: {}",
                        field
                    ))),
                }
            }
            _ => Err(Error::Config(format!("Unknown config section: {}", section))),
        }
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('.') {
        Some((section, field)) if !field.contains('.') => Ok((section, field)),
        _ => Err(Error::Config(format!(
            "Invalid config key '{}'. Expected format: section.field",
            key
        ))),
    }
}

// =============================================================================
// Connection configuration
// =============================================================================

/// Where the tool server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerTarget {
    /// Spawn a subprocess and speak over its stdin/stdout.
    Command {
        program: String,
        args: Vec<String>,
        /// Environment variable the credential is passed in, if any
        credential_env: Option<String>,
    },
    /// POST JSON-RPC messages to an HTTP endpoint.
    Url(String),
}

impl ServerTarget {
    /// A subprocess target that receives the credential in
    /// [`DEFAULT_CREDENTIAL_ENV`].
    pub fn command(program: impl Into<String>, args: Vec<String>) -> Self {
        ServerTarget::Command {
            program: program.into(),
            args,
            credential_env: Some(DEFAULT_CREDENTIAL_ENV.to_string()),
        }
    }

    /// The stock Jira server: `uvx mcp-atlassian --jira-url=... [--jira-username=...]`.
    ///
    /// The token is handed over through the environment rather than argv so
    /// it does not show up in process listings.
    pub fn jira(jira_url: &str, username: Option<&str>) -> Self {
        let mut args = vec![
            DEFAULT_JIRA_SERVER.to_string(),
            format!("--jira-url={}", jira_url),
        ];
        if let Some(user) = username {
            args.push(format!("--jira-username={}", user));
        }
        Self::command(DEFAULT_JIRA_LAUNCHER, args)
    }

    /// True when there is nothing to spawn or dial.
    pub fn is_empty(&self) -> bool {
        match self {
            ServerTarget::Command { program, .. } => program.trim().is_empty(),
            ServerTarget::Url(url) => url.trim().is_empty(),
        }
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTarget::Command { program, .. } => write!(f, "{}", program),
            ServerTarget::Url(url) => write!(f, "{}", url),
        }
    }
}

/// Everything needed to open one connection.
#[derive(Clone, PartialEq)]
pub struct ConnectionConfig {
    pub target: Option<ServerTarget>,
    pub credential: String,
    pub username: Option<String>,
    pub board_id: Option<String>,
    pub project_key: Option<String>,
    pub request_timeout: Duration,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let credential = if self.credential.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("ConnectionConfig")
            .field("target", &self.target)
            .field("credential", &credential)
            .field("username", &self.username)
            .field("board_id", &self.board_id)
            .field("project_key", &self.project_key)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl ConnectionConfig {
    /// Config with the default timeout and no scoping.
    pub fn new(target: ServerTarget, credential: impl Into<String>) -> Self {
        Self {
            target: Some(target),
            credential: credential.into(),
            username: None,
            board_id: None,
            project_key: None,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = credential.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_board(mut self, board_id: impl Into<String>) -> Self {
        self.board_id = Some(board_id.into());
        self
    }

    /// Resolve from settings overlaid with the process environment.
    pub fn from_env(settings: &Settings) -> Result<Self> {
        Self::resolve(settings, |name| std::env::var(name).ok())
    }

    /// Resolve from settings overlaid with values from `lookup`.
    ///
    /// Environment values win over the file. Empty values count as unset.
    /// Missing required values are not an error here; see [`Self::validate`].
    pub fn resolve(settings: &Settings, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let jira = settings.jira.clone().unwrap_or_default();
        let server = settings.server.clone().unwrap_or_default();

        let jira_url = var(env::JIRA_URL).or(Some(jira.url).filter(|u| !u.is_empty()));
        let username = var(env::JIRA_USERNAME).or(jira.username);
        let credential_env = Some(
            server
                .credential_env
                .clone()
                .unwrap_or_else(|| DEFAULT_CREDENTIAL_ENV.to_string()),
        );

        let target = if let Some(url) = var(env::MCP_URL) {
            Some(ServerTarget::Url(url))
        } else if let Some(command_line) = var(env::MCP_COMMAND) {
            let mut parts = command_line.split_whitespace().map(str::to_string);
            parts.next().map(|program| ServerTarget::Command {
                program,
                args: parts.collect(),
                credential_env: credential_env.clone(),
            })
        } else if let Some(url) = server.url.filter(|u| !u.trim().is_empty()) {
            Some(ServerTarget::Url(url))
        } else if let Some(program) = server.command.filter(|c| !c.trim().is_empty()) {
            Some(ServerTarget::Command {
                program,
                args: server.args,
                credential_env: credential_env.clone(),
            })
        } else {
            jira_url.as_deref().map(|url| {
                let mut target = ServerTarget::jira(url, username.as_deref());
                if let ServerTarget::Command {
                    credential_env: env_name,
                    ..
                } = &mut target
                {
                    *env_name = credential_env.clone();
                }
                target
            })
        };

        let timeout_secs = match var(env::TIMEOUT_SECS) {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                Error::invalid(
                    "timeout",
                    format!("'{}' is not a whole number of seconds", raw),
                )
            })?,
            None => server.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Self {
            target,
            credential: var(env::JIRA_TOKEN).unwrap_or_default(),
            username,
            board_id: var(env::JIRA_BOARD_ID).or(jira.board_id),
            project_key: var(env::JIRA_PROJECT_KEY).or(jira.project_key),
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Check that a connection can be attempted.
    ///
    /// Names the first offending field so the operator knows what to fix.
    pub fn validate(&self) -> Result<()> {
        match &self.target {
            None => return Err(Error::missing("target")),
            Some(target) if target.is_empty() => return Err(Error::missing("target")),
            Some(ServerTarget::Url(url))
                if !(url.starts_with("http://") || url.starts_with("https://")) =>
            {
                return Err(Error::invalid(
                    "target",
                    format!("'{}' must be an http:// or https:// URL", url),
                ));
            }
            Some(_) => {}
        }

        if self.credential.trim().is_empty() {
            return Err(Error::missing("credential"));
        }

        if self.request_timeout.is_zero() {
            return Err(Error::invalid("timeout", "must be greater than zero"));
        }

        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
