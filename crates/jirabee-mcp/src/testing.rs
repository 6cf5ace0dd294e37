//! Scripted in-process MCP server for tests.
//!
//! [`StubServer`] speaks newline-delimited JSON-RPC over a tokio duplex
//! pipe and records every message the client sends, so tests can assert
//! on the wire traffic without spawning a subprocess.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jirabee_core::{ConnectionConfig, Result, ToolDescriptor, ToolInvocationResult};
use serde_json::{json, Value};
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::{Mutex, Notify};

use crate::protocol::{JsonRpcError, JsonRpcResponse, RequestId, MCP_VERSION};
use crate::transport::{Connector, StreamTransport, Transport};

/// How the stub answers a `tools/call`.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Reply immediately.
    Result(ToolInvocationResult),
    /// Reply after a delay, without blocking other requests.
    Delayed(Duration, ToolInvocationResult),
    /// Reply with a JSON-RPC error.
    Error(JsonRpcError),
    /// Reply with the call's arguments as JSON text.
    Echo,
    /// Never reply.
    Silent,
    /// Hang up the connection.
    Disconnect,
}

/// Builder for a scripted tool server.
#[derive(Debug, Clone)]
pub struct StubServer {
    tools: Vec<ToolDescriptor>,
    replies: HashMap<String, StubReply>,
    page_size: usize,
    protocol_version: String,
    reject_initialize: Option<JsonRpcError>,
    hang_up_on_initialize: bool,
    ping_client: bool,
    correlates: bool,
}

impl Default for StubServer {
    fn default() -> Self {
        Self::new()
    }
}

impl StubServer {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            replies: HashMap::new(),
            page_size: usize::MAX,
            protocol_version: MCP_VERSION.to_string(),
            reject_initialize: None,
            hang_up_on_initialize: false,
            ping_client: false,
            correlates: true,
        }
    }

    /// Advertise a tool. Calls to it echo their arguments unless scripted.
    pub fn tool(mut self, name: &str, description: &str) -> Self {
        self.tools.push(ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        });
        self
    }

    /// Script the reply for one tool.
    pub fn reply(mut self, tool: &str, reply: StubReply) -> Self {
        self.replies.insert(tool.to_string(), reply);
        self
    }

    /// Split `tools/list` into pages of `size`.
    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn protocol_version(mut self, version: &str) -> Self {
        self.protocol_version = version.to_string();
        self
    }

    pub fn reject_initialize(mut self, error: JsonRpcError) -> Self {
        self.reject_initialize = Some(error);
        self
    }

    pub fn hang_up_on_initialize(mut self) -> Self {
        self.hang_up_on_initialize = true;
        self
    }

    /// Send a server-initiated `ping` with id `"server-ping"` after initialize.
    pub fn ping_client_after_initialize(mut self) -> Self {
        self.ping_client = true;
        self
    }

    /// Report the transport as unable to correlate responses.
    pub fn uncorrelated(mut self) -> Self {
        self.correlates = false;
        self
    }

    /// Start the server and return the client end of the pipe.
    pub fn spawn(self) -> (Box<dyn Transport>, StubLog) {
        let (client, server) = duplex(64 * 1024);
        let (client_read, client_write) = split(client);
        let log = StubLog::default();

        tokio::spawn(serve(self.clone(), server, log.clone()));

        let transport = StubTransport {
            inner: StreamTransport::new(client_read, client_write),
            correlates: self.correlates,
        };
        (Box::new(transport), log)
    }
}

struct StubTransport<R, W> {
    inner: StreamTransport<R, W>,
    correlates: bool,
}

#[async_trait]
impl<R, W> Transport for StubTransport<R, W>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: String) -> Result<()> {
        self.inner.send(message).await
    }

    async fn recv(&self) -> Result<Option<String>> {
        self.inner.recv().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn correlates_responses(&self) -> bool {
        self.correlates
    }
}

/// Everything the client sent to a [`StubServer`].
#[derive(Debug, Clone, Default)]
pub struct StubLog {
    messages: Arc<Mutex<Vec<Value>>>,
    arrived: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl StubLog {
    async fn record(&self, message: Value) {
        self.messages.lock().await.push(message);
        self.arrived.notify_waiters();
    }

    /// All messages in arrival order.
    pub async fn messages(&self) -> Vec<Value> {
        self.messages.lock().await.clone()
    }

    /// Methods of received requests and notifications, in arrival order.
    pub async fn methods(&self) -> Vec<String> {
        self.messages()
            .await
            .iter()
            .filter_map(|m| m.get("method").and_then(Value::as_str).map(String::from))
            .collect()
    }

    /// Highest number of `tools/call` requests that were unanswered at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Wait for the first message matching `predicate`. Panics after 5s.
    pub async fn wait_for(&self, predicate: impl Fn(&Value) -> bool) -> Value {
        let wait = async {
            loop {
                let arrived = self.arrived.notified();
                tokio::pin!(arrived);
                arrived.as_mut().enable();
                if let Some(found) = self.messages.lock().await.iter().find(|m| predicate(m)) {
                    return found.clone();
                }
                arrived.await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(found) => found,
            Err(_) => panic!("stub server never received the expected message"),
        }
    }

    /// Wait for a request or notification with `method`.
    pub async fn wait_for_method(&self, method: &str) -> Value {
        self.wait_for(|m| m.get("method").and_then(Value::as_str) == Some(method))
            .await
    }

    /// Wait for the client's response to a server request with string id `id`.
    pub async fn wait_for_reply_to(&self, id: &str) -> Value {
        self.wait_for(|m| m.get("method").is_none() && m.get("id") == Some(&json!(id)))
            .await
    }
}

type Writer = Arc<Mutex<Option<WriteHalf<DuplexStream>>>>;

async fn write(writer: &Writer, message: &impl serde::Serialize) {
    let Ok(mut line) = serde_json::to_string(message) else {
        return;
    };
    line.push('\n');
    if let Some(w) = writer.lock().await.as_mut() {
        let _ = w.write_all(line.as_bytes()).await;
        let _ = w.flush().await;
    }
}

async fn hang_up(writer: &Writer) {
    if let Some(mut w) = writer.lock().await.take() {
        let _ = w.shutdown().await;
    }
}

async fn serve(stub: StubServer, stream: DuplexStream, log: StubLog) {
    let (read, write_half) = split(stream);
    let writer: Writer = Arc::new(Mutex::new(Some(write_half)));
    let mut lines = BufReader::new(read).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        log.record(message.clone()).await;

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let id: RequestId = match message.get("id") {
            Some(id) if !id.is_null() => match serde_json::from_value(id.clone()) {
                Ok(id) => id,
                Err(_) => continue,
            },
            // Notification
            _ => continue,
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match method {
            "initialize" => {
                if stub.hang_up_on_initialize {
                    hang_up(&writer).await;
                    return;
                }
                if let Some(error) = &stub.reject_initialize {
                    write(&writer, &JsonRpcResponse::error(id, error.clone())).await;
                    continue;
                }
                let result = json!({
                    "protocolVersion": stub.protocol_version,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "stub-server", "version": "1.0.0"},
                });
                write(&writer, &JsonRpcResponse::success(id, result)).await;
                if stub.ping_client {
                    write(
                        &writer,
                        &json!({"jsonrpc": "2.0", "id": "server-ping", "method": "ping"}),
                    )
                    .await;
                }
            }
            "tools/list" => {
                let start = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let end = start.saturating_add(stub.page_size).min(stub.tools.len());
                let mut result = json!({"tools": stub.tools[start.min(end)..end]});
                if end < stub.tools.len() {
                    result["nextCursor"] = json!(end.to_string());
                }
                write(&writer, &JsonRpcResponse::success(id, result)).await;
            }
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let known = stub.tools.iter().any(|t| t.name == name);
                let reply = match stub.replies.get(&name) {
                    Some(reply) => reply.clone(),
                    None if known => StubReply::Echo,
                    None => StubReply::Error(JsonRpcError::invalid_params(&format!(
                        "Unknown tool: {}",
                        name
                    ))),
                };

                let now = log.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                log.max_in_flight.fetch_max(now, Ordering::SeqCst);

                let result = match reply {
                    StubReply::Result(result) => result,
                    StubReply::Echo => {
                        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                        ToolInvocationResult::text(arguments.to_string())
                    }
                    StubReply::Error(error) => {
                        log.in_flight.fetch_sub(1, Ordering::SeqCst);
                        write(&writer, &JsonRpcResponse::error(id, error)).await;
                        continue;
                    }
                    StubReply::Silent => continue,
                    StubReply::Disconnect => {
                        hang_up(&writer).await;
                        return;
                    }
                    StubReply::Delayed(delay, result) => {
                        let writer = writer.clone();
                        let log = log.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            log.in_flight.fetch_sub(1, Ordering::SeqCst);
                            respond(&writer, id, &result).await;
                        });
                        continue;
                    }
                };
                log.in_flight.fetch_sub(1, Ordering::SeqCst);
                respond(&writer, id, &result).await;
            }
            "ping" => write(&writer, &JsonRpcResponse::success(id, json!({}))).await,
            other => {
                write(
                    &writer,
                    &JsonRpcResponse::error(id, JsonRpcError::method_not_found(other)),
                )
                .await
            }
        }
    }
}

async fn respond(writer: &Writer, id: RequestId, result: &ToolInvocationResult) {
    let value = serde_json::to_value(result).unwrap_or(Value::Null);
    write(writer, &JsonRpcResponse::success(id, value)).await;
}

/// [`Connector`] that starts a fresh [`StubServer`] for every connection.
#[derive(Debug, Clone)]
pub struct StubConnector {
    server: StubServer,
    logs: Arc<std::sync::Mutex<Vec<StubLog>>>,
}

impl StubConnector {
    pub fn new(server: StubServer) -> Self {
        Self {
            server,
            logs: Arc::default(),
        }
    }

    /// Number of transports opened so far.
    pub fn opened(&self) -> usize {
        self.logs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Log of the most recently opened connection.
    pub fn last_log(&self) -> Option<StubLog> {
        self.logs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn open(&self, _config: &ConnectionConfig) -> Result<Box<dyn Transport>> {
        let (transport, log) = self.server.clone().spawn();
        self.logs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(log);
        Ok(transport)
    }
}
