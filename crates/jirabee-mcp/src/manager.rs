//! Tool connection manager.
//!
//! Owns every connection to an external tool server. Callers get an
//! `Arc<ConnectionHandle>` they can read from; only the manager moves a
//! handle through `Connecting -> Ready -> Closed`.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use jirabee_core::{
    ConnectionConfig, ConnectionState, Error, Result, ToolDescriptor, ToolInvocationRequest,
    ToolInvocationResult,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::protocol::ServerInfo;
use crate::session::ClientSession;
use crate::transport::{Connector, DefaultConnector};

/// Client name sent during `initialize`.
pub const CLIENT_NAME: &str = "jirabee";

/// Client version sent during `initialize`.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A connection to one tool server.
///
/// Read-only for callers. Invocations go through [`ToolConnectionManager`].
pub struct ConnectionHandle {
    id: u64,
    server: String,
    state: AtomicU8,
    session: ClientSession,
    request_timeout: Duration,
    tools: OnceLock<Vec<ToolDescriptor>>,
    capabilities: OnceLock<HashSet<String>>,
    server_info: OnceLock<Option<ServerInfo>>,
    // Held across a call when the transport cannot correlate responses.
    call_lock: Mutex<()>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable target, safe to log.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Current state. A ready handle whose transport went away reads as `Closed`.
    pub fn state(&self) -> ConnectionState {
        let state = ConnectionState::from_u8(self.state.load(Ordering::SeqCst));
        if state == ConnectionState::Ready && !self.session.is_open() {
            ConnectionState::Closed
        } else {
            state
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Names of the tools the server advertised. Empty until the handshake completes.
    pub fn capabilities(&self) -> HashSet<String> {
        self.capabilities.get().cloned().unwrap_or_default()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities
            .get()
            .is_some_and(|names| names.contains(name))
    }

    /// Full descriptors of the advertised tools.
    pub fn tools(&self) -> &[ToolDescriptor] {
        self.tools.get().map(Vec::as_slice).unwrap_or_default()
    }

    pub fn tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools().iter().find(|t| t.name == name)
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.get().and_then(Option::as_ref)
    }

    /// Timeout applied to calls that don't specify one.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(server = %self.server, id = self.id, from = %previous, to = %state, "State change");
        }
    }

    /// `Connecting -> Ready`. Fails if the handle was closed meanwhile.
    fn mark_ready(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Ready as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("state", &self.state())
            .field("tools", &self.tools().len())
            .finish()
    }
}

/// Establishes, tracks and tears down tool-server connections.
///
/// Construct one per process and share it behind an `Arc`.
pub struct ToolConnectionManager {
    connector: Arc<dyn Connector>,
    handles: RwLock<HashMap<u64, Arc<ConnectionHandle>>>,
    next_id: AtomicU64,
}

impl Default for ToolConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolConnectionManager {
    /// Manager that spawns subprocesses and dials URLs.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(DefaultConnector))
    }

    /// Manager with a custom way of opening transports.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Validate the config, open a transport and run the handshake.
    ///
    /// A config without target or credential fails with a configuration
    /// error before any process or socket is touched. A failed handshake
    /// leaves the handle `Closed` and unregistered.
    ///
    /// The handle is registered only once it is `Ready`. If this future is
    /// dropped mid-handshake the handle is dropped with it, which stops its
    /// reader and releases the transport.
    pub async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<ConnectionHandle>> {
        let handle = self.open(config).await?;
        match self.initialize(&handle).await {
            Ok(()) => {
                self.handles.write().await.insert(handle.id, handle.clone());
                Ok(handle)
            }
            Err(e) => {
                warn!(server = %handle.server, error = %e, "Connection failed");
                self.close(&handle).await;
                Err(e)
            }
        }
    }

    /// [`connect`](Self::connect), wrapped in a guard that closes on drop.
    pub async fn connect_scoped(self: &Arc<Self>, config: &ConnectionConfig) -> Result<HandleGuard> {
        let handle = self.connect(config).await?;
        Ok(HandleGuard {
            manager: self.clone(),
            handle,
            armed: true,
        })
    }

    /// Open the transport and build a `Connecting` handle.
    async fn open(&self, config: &ConnectionConfig) -> Result<Arc<ConnectionHandle>> {
        config.validate()?;

        let server = config
            .target
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        info!(server = %server, "Connecting to tool server");

        let transport = self.connector.open(config).await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let handle = Arc::new(ConnectionHandle {
            id,
            session: ClientSession::start(transport, server.clone()),
            server,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            request_timeout: config.request_timeout,
            tools: OnceLock::new(),
            capabilities: OnceLock::new(),
            server_info: OnceLock::new(),
            call_lock: Mutex::new(()),
        });

        Ok(handle)
    }

    /// Handshake on a `Connecting` handle and move it to `Ready`.
    async fn initialize(&self, handle: &ConnectionHandle) -> Result<()> {
        let handshake = handle
            .session
            .handshake(CLIENT_NAME, CLIENT_VERSION, handle.request_timeout)
            .await?;

        let names = handshake.tools.iter().map(|t| t.name.clone()).collect();
        let _ = handle.capabilities.set(names);
        let _ = handle.tools.set(handshake.tools);
        let _ = handle.server_info.set(handshake.info.server_info);

        if !handle.mark_ready() {
            return Err(Error::Closed(format!(
                "connection to '{}' was closed during the handshake",
                handle.server
            )));
        }

        info!(
            server = %handle.server,
            id = handle.id,
            tools = handle.tools().len(),
            "Connection ready"
        );
        Ok(())
    }

    /// Call a tool with the handle's default timeout.
    pub async fn invoke(
        &self,
        handle: &ConnectionHandle,
        request: ToolInvocationRequest,
    ) -> Result<ToolInvocationResult> {
        self.invoke_with_timeout(handle, request, handle.request_timeout)
            .await
    }

    /// Call a tool, waiting at most `timeout` for the reply.
    ///
    /// A tool that reports failure comes back as `Ok` with `is_error` set;
    /// only connection-level problems are `Err`. A timeout leaves the
    /// handle `Ready`.
    pub async fn invoke_with_timeout(
        &self,
        handle: &ConnectionHandle,
        request: ToolInvocationRequest,
        timeout: Duration,
    ) -> Result<ToolInvocationResult> {
        self.ensure_ready(handle)?;

        if !handle.has_capability(&request.tool_name) {
            return Err(Error::UnknownTool(format!(
                "'{}' is not offered by '{}'",
                request.tool_name, handle.server
            )));
        }

        let _serial = if handle.session.correlates_responses() {
            None
        } else {
            Some(handle.call_lock.lock().await)
        };
        // The connection may have closed while we queued.
        self.ensure_ready(handle)?;

        debug!(server = %handle.server, tool = %request.tool_name, "Invoking tool");

        let outcome = handle
            .session
            .call_tool(&request.tool_name, request.arguments, timeout)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                if !handle.session.is_open() {
                    handle.set_state(ConnectionState::Closed);
                }
                return Err(e);
            }
        };

        match outcome {
            Ok(value) => serde_json::from_value(value).map_err(|e| {
                Error::Transport(format!(
                    "Malformed result from tool '{}': {}",
                    request.tool_name, e
                ))
            }),
            // The server refused the call itself; report it like a tool failure.
            Err(rpc) => {
                debug!(server = %handle.server, tool = %request.tool_name, error = %rpc, "Tool call rejected");
                Ok(ToolInvocationResult::error(rpc.message))
            }
        }
    }

    /// Round-trip a `ping` over a ready connection.
    pub async fn ping(&self, handle: &ConnectionHandle) -> Result<()> {
        self.ensure_ready(handle)?;
        handle.session.ping(handle.request_timeout).await
    }

    fn ensure_ready(&self, handle: &ConnectionHandle) -> Result<()> {
        match handle.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Connecting => Err(Error::NotReady(format!(
                "connection to '{}' has not completed its handshake",
                handle.server
            ))),
            ConnectionState::Closed => {
                // Record a disconnect noticed through the session.
                handle.set_state(ConnectionState::Closed);
                Err(Error::Closed(format!(
                    "connection to '{}' is closed",
                    handle.server
                )))
            }
        }
    }

    /// Close a handle. In-flight calls fail with `Closed`. Idempotent.
    pub async fn close(&self, handle: &ConnectionHandle) {
        let previous = ConnectionState::from_u8(
            handle
                .state
                .swap(ConnectionState::Closed as u8, Ordering::SeqCst),
        );
        self.handles.write().await.remove(&handle.id);

        if previous == ConnectionState::Closed {
            debug!(server = %handle.server, id = handle.id, "Already closed");
            return;
        }

        handle.session.close().await;
        info!(server = %handle.server, id = handle.id, "Connection closed");
    }

    /// Close every registered handle.
    pub async fn close_all(&self) {
        let handles: Vec<_> = self.handles.read().await.values().cloned().collect();
        for handle in handles {
            self.close(&handle).await;
        }
    }

    /// Ready handles that have not been closed through the manager.
    pub async fn handles(&self) -> Vec<Arc<ConnectionHandle>> {
        self.handles.read().await.values().cloned().collect()
    }
}

/// Closes its handle when dropped.
///
/// The close is spawned on the current tokio runtime. Call
/// [`HandleGuard::close`] to close and wait.
pub struct HandleGuard {
    manager: Arc<ToolConnectionManager>,
    handle: Arc<ConnectionHandle>,
    armed: bool,
}

impl HandleGuard {
    pub fn manager(&self) -> &Arc<ToolConnectionManager> {
        &self.manager
    }

    /// Another reference to the guarded handle.
    pub fn handle(&self) -> Arc<ConnectionHandle> {
        self.handle.clone()
    }

    /// Close now and wait for it.
    pub async fn close(mut self) {
        self.armed = false;
        self.manager.close(&self.handle).await;
    }
}

impl Deref for HandleGuard {
    type Target = ConnectionHandle;

    fn deref(&self) -> &ConnectionHandle {
        &self.handle
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = self.manager.clone();
                let handle = self.handle.clone();
                runtime.spawn(async move { manager.close(&handle).await });
            }
            Err(_) => warn!(server = %self.handle.server, "Handle dropped outside a runtime, not closed"),
        }
    }
}
