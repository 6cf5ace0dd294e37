//! Client session: the post-handshake wrapper around a transport.
//!
//! The session lifecycle:
//! 1. Start - spawn the reader task that routes responses by request id
//! 2. Handshake - `initialize`, `notifications/initialized`, `tools/list`
//! 3. Requests - any number, concurrently, each matched to its response
//! 4. Close - fail everything in flight with `Closed`, release the transport

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use jirabee_core::{Error, Result, ToolDescriptor};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    methods, IncomingMessage, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ToolCallParams, ToolsListResult,
    SUPPORTED_VERSIONS,
};
use crate::transport::Transport;

/// Outcome of one request: the result value, or the error the server replied with.
pub type RemoteOutcome = std::result::Result<Value, JsonRpcError>;

type Pending = HashMap<i64, oneshot::Sender<Result<JsonRpcResponse>>>;

/// Upper bound on `tools/list` pages, in case a server keeps handing out cursors.
const MAX_TOOL_PAGES: usize = 64;

/// What the handshake discovered.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info: InitializeResult,
    pub tools: Vec<ToolDescriptor>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    pending: Mutex<Pending>,
    open: AtomicBool,
    server: String,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the session unusable and fail every waiting request.
    fn shut(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let drained: Vec<_> = self.pending().drain().collect();
        for (id, tx) in drained {
            debug!(server = %self.server, id, "Failing in-flight request: {}", reason);
            let _ = tx.send(Err(Error::Closed(reason.to_string())));
        }
    }
}

/// A JSON-RPC session with one tool server.
pub struct ClientSession {
    shared: Arc<Shared>,
    next_id: AtomicI64,
    closing: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// Take ownership of a transport and start routing its messages.
    pub fn start(transport: Box<dyn Transport>, server: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            transport: Arc::from(transport),
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            server: server.into(),
        });

        let reader = tokio::spawn(read_loop(shared.clone()));

        Self {
            shared,
            next_id: AtomicI64::new(1),
            closing: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Whether the session can still carry requests.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Whether the transport matches responses to requests by id.
    pub fn correlates_responses(&self) -> bool {
        self.shared.transport.correlates_responses()
    }

    pub fn server(&self) -> &str {
        &self.shared.server
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// The outer `Result` is about the connection; the inner one carries a
    /// JSON-RPC error the server replied with. If the returned future is
    /// dropped before completion (timeout or caller cancellation) the
    /// request is withdrawn locally and the server is told via
    /// `notifications/cancelled`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<RemoteOutcome> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        {
            // Checked under the lock so `shut` cannot miss this entry.
            let mut pending = self.shared.pending();
            if !self.is_open() {
                return Err(Error::Closed(format!(
                    "session with '{}' is closed",
                    self.shared.server
                )));
            }
            pending.insert(id, tx);
        }
        let mut guard = InFlight {
            shared: &self.shared,
            id,
            answered: false,
        };

        let message = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let ended = || Error::Closed(format!("session with '{}' ended", self.shared.server));
        let exchange = async {
            let mut rx = rx;
            // HTTP sends last until the reply arrives; `shut` must still wake us.
            tokio::select! {
                sent = self.shared.transport.send(message) => sent?,
                reply = &mut rx => return reply.map_err(|_| ended())?,
            }
            rx.await.map_err(|_| ended())?
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => {
                guard.answered = true;
                Ok(response.into_outcome())
            }
            Ok(Err(e)) => {
                guard.answered = true;
                Err(e)
            }
            Err(_) => {
                warn!(server = %self.shared.server, id, method, "Request timed out");
                Err(Error::Timeout {
                    tool: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed(format!(
                "session with '{}' is closed",
                self.shared.server
            )));
        }
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.shared.transport.send(message).await
    }

    /// Run the MCP handshake and discover the server's tools.
    ///
    /// Failures map onto connect-time errors: an unreachable or silent
    /// server is `Transport`, a refused credential is `Auth`, anything else
    /// the server objects to is `Handshake`.
    pub async fn handshake(
        &self,
        client_name: &str,
        client_version: &str,
        timeout: Duration,
    ) -> Result<Handshake> {
        let params = serde_json::to_value(InitializeParams::new(client_name, client_version))?;

        let outcome = self
            .request(methods::INITIALIZE, Some(params), timeout)
            .await
            .map_err(|e| connect_error(e, &self.shared.server))?;

        let value = outcome.map_err(|e| {
            if e.is_auth_rejection() {
                Error::Auth(format!("'{}' rejected the credential: {}", self.shared.server, e))
            } else {
                Error::Handshake(format!("'{}' refused initialize: {}", self.shared.server, e))
            }
        })?;

        let info: InitializeResult = serde_json::from_value(value).map_err(|e| {
            Error::Handshake(format!("Malformed initialize result: {}", e))
        })?;

        if !SUPPORTED_VERSIONS.contains(&info.protocol_version.as_str()) {
            return Err(Error::Handshake(format!(
                "'{}' speaks unsupported protocol version {}",
                self.shared.server, info.protocol_version
            )));
        }

        info!(
            server = %self.shared.server,
            version = %info.protocol_version,
            "Tool server initialized"
        );

        self.notify(methods::INITIALIZED, None)
            .await
            .map_err(|e| connect_error(e, &self.shared.server))?;

        let tools = if info.capabilities.tools.is_some() {
            self.list_tools(timeout).await?
        } else {
            debug!(server = %self.shared.server, "Server advertises no tools capability");
            Vec::new()
        };

        info!(server = %self.shared.server, tools = tools.len(), "Tools discovered");

        Ok(Handshake { info, tools })
    }

    /// Fetch every page of `tools/list`.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let outcome = self
                .request(methods::TOOLS_LIST, params, timeout)
                .await
                .map_err(|e| connect_error(e, &self.shared.server))?;
            let value = outcome.map_err(|e| {
                Error::Handshake(format!("'{}' refused tools/list: {}", self.shared.server, e))
            })?;
            let page: ToolsListResult = serde_json::from_value(value)
                .map_err(|e| Error::Handshake(format!("Malformed tools/list result: {}", e)))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        warn!(server = %self.shared.server, "tools/list pagination limit reached");
        Ok(tools)
    }

    /// Issue `tools/call`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        timeout: Duration,
    ) -> Result<RemoteOutcome> {
        let params = serde_json::to_value(ToolCallParams {
            name: name.to_string(),
            arguments,
        })?;
        self.request(methods::TOOLS_CALL, Some(params), timeout)
            .await
            .map_err(|e| match e {
                Error::Timeout { timeout, .. } => Error::Timeout {
                    tool: name.to_string(),
                    timeout,
                },
                other => other,
            })
    }

    /// Liveness probe.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        self.request(methods::PING, None, timeout)
            .await?
            .map(|_| ())
            .map_err(|e| Error::Transport(format!("ping rejected: {}", e)))
    }

    /// Fail in-flight requests and release the transport. Idempotent.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.shut("connection closed");

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }

        if let Err(e) = self.shared.transport.close().await {
            warn!(server = %self.shared.server, error = %e, "Error releasing transport");
        }

        info!(server = %self.shared.server, "Session closed");
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.shared.open.store(false, Ordering::SeqCst);
        if let Some(reader) = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }
}

/// Withdraws a request whose future is dropped before the response arrives.
struct InFlight<'a> {
    shared: &'a Arc<Shared>,
    id: i64,
    answered: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let withdrawn = self.shared.pending().remove(&self.id).is_some();
        if self.answered || !withdrawn || !self.shared.open.load(Ordering::SeqCst) {
            return;
        }

        // A late response will find no pending entry and be discarded.
        debug!(server = %self.shared.server, id = self.id, "Cancelling request");
        let Ok(message) = serde_json::to_string(&JsonRpcNotification::cancelled(
            self.id,
            "request abandoned by client",
        )) else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let transport = self.shared.transport.clone();
            runtime.spawn(async move {
                if let Err(e) = transport.send(message).await {
                    debug!(error = %e, "Failed to send cancellation");
                }
            });
        }
    }
}

/// Errors while connecting mean the server is unreachable, not that it said no.
fn connect_error(e: Error, server: &str) -> Error {
    match e {
        Error::Timeout { timeout, .. } => Error::Transport(format!(
            "'{}' did not answer the handshake within {:?}",
            server, timeout
        )),
        Error::Closed(reason) => Error::Transport(format!(
            "'{}' went away during the handshake: {}",
            server, reason
        )),
        other => other,
    }
}

async fn read_loop(shared: Arc<Shared>) {
    loop {
        match shared.transport.recv().await {
            Ok(Some(line)) => dispatch(&shared, &line).await,
            Ok(None) => {
                info!(server = %shared.server, "Tool server closed the connection");
                break;
            }
            Err(e) => {
                error!(server = %shared.server, error = %e, "Error reading from tool server");
                break;
            }
        }
    }
    shared.shut("transport disconnected");
}

async fn dispatch(shared: &Shared, line: &str) {
    match IncomingMessage::parse(line) {
        Ok(IncomingMessage::Response(response)) => {
            let Some(id) = response.id.as_number() else {
                warn!(server = %shared.server, "Response without usable id: {}", line);
                return;
            };
            let waiter = shared.pending().remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => debug!(server = %shared.server, id, "Discarding late or unknown response"),
            }
        }
        Ok(IncomingMessage::Request(request)) => {
            let reply = match request.method.as_str() {
                methods::PING => JsonRpcResponse::success(request.id, serde_json::json!({})),
                method => {
                    debug!(server = %shared.server, method, "Unsupported server request");
                    JsonRpcResponse::error(request.id, JsonRpcError::method_not_found(method))
                }
            };
            match serde_json::to_string(&reply) {
                Ok(message) => {
                    if let Err(e) = shared.transport.send(message).await {
                        warn!(server = %shared.server, error = %e, "Failed to answer server request");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize reply"),
            }
        }
        Ok(IncomingMessage::Notification(notification)) => {
            debug!(server = %shared.server, method = %notification.method, "Server notification");
        }
        Err(_) => {
            // Some servers print banners on stdout before speaking JSON-RPC.
            debug!(server = %shared.server, "Ignoring non-JSON-RPC line: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubReply, StubServer};
    use jirabee_core::ToolInvocationResult;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn session_for(stub: StubServer) -> (ClientSession, crate::testing::StubLog) {
        let (transport, log) = stub.spawn();
        (ClientSession::start(transport, "stub"), log)
    }

    #[tokio::test]
    async fn test_handshake_discovers_tools() {
        let (session, log) = session_for(
            StubServer::new()
                .tool("search_issues", "Search with JQL")
                .tool("get_sprint", "Sprint details"),
        );

        let handshake = session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap();
        let names: Vec<_> = handshake.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["search_issues", "get_sprint"]);
        assert_eq!(handshake.info.server_info.unwrap().name, "stub-server");

        let methods = log.methods().await;
        assert_eq!(
            methods,
            vec!["initialize", "notifications/initialized", "tools/list"]
        );
    }

    #[tokio::test]
    async fn test_handshake_follows_pagination() {
        let (session, _log) = session_for(
            StubServer::new()
                .tool("a", "")
                .tool("b", "")
                .tool("c", "")
                .page_size(2),
        );

        let handshake = session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap();
        assert_eq!(handshake.tools.len(), 3);
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_handshake_error() {
        let (session, _log) = session_for(
            StubServer::new().reject_initialize(JsonRpcError::new(-32602, "Unsupported version")),
        );

        let err = session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_handshake_auth_rejection_is_auth_error() {
        let (session, _log) = session_for(StubServer::new().reject_initialize(
            JsonRpcError::new(JsonRpcError::UNAUTHORIZED, "Invalid API token"),
        ));

        let err = session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_handshake_unsupported_version() {
        let (session, _log) = session_for(StubServer::new().protocol_version("1999-01-01"));

        let err = session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(ref m) if m.contains("1999-01-01")));
    }

    #[tokio::test]
    async fn test_handshake_against_dead_server_is_transport_error() {
        let (session, _log) = session_for(StubServer::new().hang_up_on_initialize());

        let err = session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {:?}", err);
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let (session, _log) = session_for(
            StubServer::new()
                .tool("slow", "")
                .tool("fast", "")
                .reply(
                    "slow",
                    StubReply::Delayed(Duration::from_millis(100), ToolInvocationResult::text("slow")),
                )
                .reply("fast", StubReply::Result(ToolInvocationResult::text("fast"))),
        );
        session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap();

        let (slow, fast) = tokio::join!(
            session.call_tool("slow", Map::new(), TIMEOUT),
            session.call_tool("fast", Map::new(), TIMEOUT),
        );

        let slow: ToolInvocationResult =
            serde_json::from_value(slow.unwrap().unwrap()).unwrap();
        let fast: ToolInvocationResult =
            serde_json::from_value(fast.unwrap().unwrap()).unwrap();
        assert_eq!(slow.joined_text(), "slow");
        assert_eq!(fast.joined_text(), "fast");
    }

    #[tokio::test]
    async fn test_server_ping_is_answered() {
        let (session, log) = session_for(StubServer::new().ping_client_after_initialize());
        session.handshake("jirabee", "0.1.0", TIMEOUT).await.unwrap();

        let reply = log.wait_for_reply_to("server-ping").await;
        assert_eq!(reply["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_ping() {
        let (session, _log) = session_for(StubServer::new());
        session.ping(TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_after_close_fails_fast() {
        let (session, log) = session_for(StubServer::new());
        session.close().await;
        session.close().await;

        let err = session.ping(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
        assert!(log.methods().await.is_empty());
    }
}
