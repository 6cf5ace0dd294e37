//! Transport layer for MCP JSON-RPC communication.
//!
//! A transport moves serialized JSON-RPC messages in both directions and
//! nothing more. It cannot call tools: callers only ever see the
//! capability-checked [`ConnectionHandle`](crate::ConnectionHandle) that
//! wraps a finished session.
//!
//! Over stdio, MCP uses newline-delimited JSON.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use jirabee_core::{ConnectionConfig, Error, Result, ServerTarget};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines,
};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::http::HttpTransport;

/// How long a child gets to exit after its stdin closes before it is killed.
const CHILD_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Bidirectional message channel to a tool server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one serialized JSON-RPC message.
    async fn send(&self, message: String) -> Result<()>;

    /// Receive the next message. `Ok(None)` means the peer hung up.
    async fn recv(&self) -> Result<Option<String>>;

    /// Release the underlying resources. Must be safe to call more than once.
    async fn close(&self) -> Result<()>;

    /// Whether responses are matched to requests by id.
    ///
    /// When false the manager keeps at most one request in flight.
    fn correlates_responses(&self) -> bool {
        true
    }
}

/// Opens a transport for a connection config.
///
/// The manager only calls this after the config has been validated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>>;
}

/// Spawns subprocess targets and dials URL targets.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn open(&self, config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        match &config.target {
            Some(ServerTarget::Command {
                program,
                args,
                credential_env,
            }) => {
                let mut env = Vec::new();
                if let Some(name) = credential_env {
                    env.push((name.clone(), config.credential.clone()));
                }
                let transport = StdioTransport::spawn(program, args, &env)?;
                Ok(Box::new(transport))
            }
            Some(ServerTarget::Url(url)) => {
                let transport = HttpTransport::new(url, &config.credential)?;
                Ok(Box::new(transport))
            }
            None => Err(Error::missing("target")),
        }
    }
}

// =============================================================================
// StreamTransport - newline-delimited JSON over any byte stream pair
// =============================================================================

/// Newline-delimited JSON over an async reader/writer pair.
pub struct StreamTransport<R, W> {
    reader: Mutex<Lines<BufReader<R>>>,
    writer: Mutex<Option<W>>,
}

impl<R, W> StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader).lines()),
            writer: Mutex::new(Some(writer)),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StreamTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: String) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Closed("transport already closed".into()))?;

        tracing::debug!("Sending: {}", message);

        writer
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::Transport(format!("Failed to write message: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| Error::Transport(format!("Failed to write newline: {}", e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Transport(format!("Failed to flush: {}", e)))
    }

    async fn recv(&self) -> Result<Option<String>> {
        let mut lines = self.reader.lock().await;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::debug!("Received: {}", line);
                    return Ok(Some(line.to_string()));
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(Error::Transport(format!("Failed to read message: {}", e))),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Writer shutdown failed: {}", e);
            }
        }
        Ok(())
    }
}

// =============================================================================
// StdioTransport - subprocess speaking MCP on stdin/stdout
// =============================================================================

/// Transport over a spawned server's stdin/stdout.
///
/// The child is killed if the transport is dropped without being closed.
pub struct StdioTransport {
    stream: StreamTransport<ChildStdout, ChildStdin>,
    child: Mutex<Child>,
    program: String,
}

impl StdioTransport {
    /// Spawn `program` with piped stdio.
    pub fn spawn(program: &str, args: &[String], env: &[(String, String)]) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!("Failed to spawn tool server '{}': {}", program, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("Tool server stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("Tool server stdout not available".into()))?;

        // Server logs go to stderr; surface them at debug level.
        if let Some(stderr) = child.stderr.take() {
            let name = program.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "{}", line);
                }
            });
        }

        tracing::info!(server = %program, pid = ?child.id(), "Spawned tool server");

        Ok(Self {
            stream: StreamTransport::new(stdout, stdin),
            child: Mutex::new(child),
            program: program.to_string(),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, message: String) -> Result<()> {
        self.stream.send(message).await
    }

    async fn recv(&self) -> Result<Option<String>> {
        self.stream.recv().await
    }

    async fn close(&self) -> Result<()> {
        // Closing stdin is the polite shutdown signal for stdio servers.
        self.stream.close().await?;

        let mut child = self.child.lock().await;
        match tokio::time::timeout(CHILD_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.program, %status, "Tool server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Transport(format!(
                "Failed to wait for tool server '{}': {}",
                self.program, e
            ))),
            Err(_) => {
                tracing::warn!(server = %self.program, "Tool server did not exit, killing it");
                child.kill().await.map_err(|e| {
                    Error::Transport(format!(
                        "Failed to kill tool server '{}': {}",
                        self.program, e
                    ))
                })
            }
        }
    }
}
