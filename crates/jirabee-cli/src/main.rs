//! jirabee CLI - talk to a Jira tool server from the command line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use jirabee_core::{ConnectionConfig, Settings, ToolInvocationRequest};
use jirabee_jira::{JiraOutcome, JiraTools, SprintState};
use jirabee_mcp::{HandleGuard, ToolConnectionManager};
use jirabee_storage::{KeychainStore, Login};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jirabee")]
#[command(author, version, about = "jirabee - Jira through an MCP tool server", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file to use instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Never read or write the OS keychain
    #[arg(long, global = true)]
    no_keychain: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tools the server offers
    Tools,

    /// Call a tool and print its result as JSON
    Call {
        /// Tool name
        tool: String,

        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,

        /// Timeout in seconds (defaults to the configured request timeout)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Check that the server is reachable and answering
    Ping,

    /// Search issues with JQL
    Search {
        /// JQL query
        jql: String,
    },

    /// Show one sprint
    Sprint {
        /// Sprint ID
        id: String,
    },

    /// List sprints of a board
    Sprints {
        /// Board ID (defaults to jira.board_id / JIRA_BOARD_ID)
        #[arg(short, long)]
        board: Option<String>,

        /// Only sprints in this state: future, active or closed
        #[arg(short, long)]
        state: Option<SprintState>,
    },

    /// Manage the settings file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Save the Jira API token in the OS keychain
    Login {
        /// Jira API token
        #[arg(long)]
        token: String,

        /// Account the token belongs to
        #[arg(long)]
        username: Option<String>,
    },

    /// Remove the saved Jira API token
    Logout,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current settings
    Show,

    /// Print the settings file location
    Path,

    /// Get one value, e.g. `jira.url`
    Get { key: String },

    /// Set one value, e.g. `jira.url https://example.atlassian.net`
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging. Stdout is reserved for command output.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            if let Some(hint) = e
                .downcast_ref::<jirabee_core::Error>()
                .and_then(jirabee_core::Error::remediation)
            {
                eprintln!("hint: {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings_path = match &cli.config {
        Some(path) => path.clone(),
        None => Settings::config_path()?,
    };

    let Some(command) = cli.command else {
        println!("jirabee - Jira through an MCP tool server");
        println!("Run with --help for usage information");
        return Ok(ExitCode::SUCCESS);
    };

    match command {
        Commands::Config { command } => {
            config_command(command, &settings_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Login { token, username } => {
            keychain_login(cli.no_keychain)?.save(&token, username.as_deref())?;
            println!("Token saved to the OS keychain");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logout => {
            keychain_login(cli.no_keychain)?.clear()?;
            println!("Token removed from the OS keychain");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Call {
            tool,
            args,
            timeout,
        } => {
            let arguments: serde_json::Value = serde_json::from_str(&args)
                .with_context(|| format!("--args is not valid JSON: {}", args))?;
            let request = ToolInvocationRequest::with_arguments(tool, arguments)?;

            let (manager, handle) = connect(&settings_path, cli.no_keychain).await?;
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or(handle.request_timeout());
            let result = manager.invoke_with_timeout(&handle, request, timeout).await;
            handle.close().await;
            let result = result?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error {
                eprintln!("error: the tool reported a failure");
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Tools => {
            let (_manager, handle) = connect(&settings_path, cli.no_keychain).await?;
            for tool in handle.tools() {
                let summary = tool.description.lines().next().unwrap_or_default();
                println!("{:<32} {}", tool.name, summary);
            }
            handle.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ping => {
            let (manager, handle) = connect(&settings_path, cli.no_keychain).await?;
            let started = std::time::Instant::now();
            let result = manager.ping(&handle).await;
            let server = match handle.server_info() {
                Some(info) => format!("{} {}", info.name, info.version),
                None => handle.server().to_string(),
            };
            let tools = handle.tools().len();
            handle.close().await;
            result?;
            println!(
                "{}: ready, {} tools, ping {} ms",
                server,
                tools,
                started.elapsed().as_millis()
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Search { jql } => {
            let (jira, guard) = connect_jira(&settings_path, cli.no_keychain).await?;
            let outcome = jira.search_issues(&jql, &["summary", "status", "assignee"]).await;
            guard.close().await;
            print_outcome(outcome?)
        }
        Commands::Sprint { id } => {
            let (jira, guard) = connect_jira(&settings_path, cli.no_keychain).await?;
            let outcome = jira.get_sprint(&id).await;
            guard.close().await;
            print_outcome(outcome?)
        }
        Commands::Sprints { board, state } => {
            let (jira, guard) = connect_jira(&settings_path, cli.no_keychain).await?;
            let outcome = jira.get_board_sprints(board.as_deref(), state).await;
            guard.close().await;
            print_outcome(outcome?)
        }
    }
}

fn config_command(command: ConfigCommands, path: &Path) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => {
            let settings = Settings::load_from(path)?;
            let rendered = toml::to_string_pretty(&settings)?;
            if rendered.trim().is_empty() {
                println!("# {} is empty", path.display());
            } else {
                print!("{}", rendered);
            }
        }
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Get { key } => {
            let settings = Settings::load_from(path)?;
            match settings.get(&key)? {
                Some(value) => println!("{}", value),
                None => bail!("{} is not set", key),
            }
        }
        ConfigCommands::Set { key, value } => {
            let mut settings = Settings::load_from(path)?;
            settings.set(&key, &value)?;
            settings.save_to(path)?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

fn keychain_login(no_keychain: bool) -> anyhow::Result<Login<KeychainStore>> {
    if no_keychain {
        bail!("the keychain is disabled by --no-keychain");
    }
    Ok(Login::new(KeychainStore::new()))
}

/// Resolve the connection config: settings file, then environment, then keychain.
fn connection_config(settings_path: &Path, no_keychain: bool) -> anyhow::Result<ConnectionConfig> {
    let settings = Settings::load_from(settings_path)?;
    let mut config = ConnectionConfig::from_env(&settings)?;

    if config.credential.is_empty() && !no_keychain {
        let login = Login::new(KeychainStore::new());
        match login.credential(None) {
            Ok(Some(token)) => config.credential = token,
            Ok(None) => {}
            // No keychain on this machine is the same as no saved token.
            Err(e) => tracing::warn!(error = %e, "Keychain unavailable"),
        }
        if config.username.is_none() {
            config.username = login.username().ok().flatten();
        }
    }

    tracing::debug!(config = ?config, "Resolved connection config");
    Ok(config)
}

async fn connect(
    settings_path: &Path,
    no_keychain: bool,
) -> anyhow::Result<(Arc<ToolConnectionManager>, HandleGuard)> {
    let config = connection_config(settings_path, no_keychain)?;
    let manager = Arc::new(ToolConnectionManager::new());
    let guard = manager.connect_scoped(&config).await?;
    Ok((manager, guard))
}

async fn connect_jira(settings_path: &Path, no_keychain: bool) -> anyhow::Result<(JiraTools, HandleGuard)> {
    let config = connection_config(settings_path, no_keychain)?;
    let manager = Arc::new(ToolConnectionManager::new());
    let guard = manager.connect_scoped(&config).await?;
    let jira = JiraTools::new(manager, guard.handle()).with_board(config.board_id.clone());
    Ok((jira, guard))
}

fn print_outcome(outcome: JiraOutcome) -> anyhow::Result<ExitCode> {
    match outcome {
        JiraOutcome::Data(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        JiraOutcome::ToolError(message) => {
            eprintln!("error: {}", message);
            Ok(ExitCode::FAILURE)
        }
    }
}
