//! HTTP transport for tool servers that are already running.
//!
//! Each outgoing JSON-RPC message is POSTed to the server URL. The reply
//! body (plain JSON or a `text/event-stream` of JSON events) is queued for
//! [`Transport::recv`], so the session reads HTTP and stdio replies the
//! same way.

use async_trait::async_trait;
use jirabee_core::{Error, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::transport::Transport;

/// Header carrying the server-assigned session id.
const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC over HTTP POST.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    credential: String,
    session_id: Mutex<Option<String>>,
    inbox_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl HttpTransport {
    /// Create a transport for `url`, authenticating with a bearer credential.
    pub fn new(url: impl Into<String>, credential: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("jirabee/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            client,
            url: url.into(),
            credential: credential.into(),
            session_id: Mutex::new(None),
            inbox_tx: Mutex::new(Some(tx)),
            inbox_rx: Mutex::new(rx),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: String) -> Result<()> {
        let inbox = self
            .inbox_tx
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Closed("transport already closed".into()))?;

        debug!(url = %self.url, "Sending: {}", message);

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .bearer_auth(&self.credential)
            .body(message);
        if let Some(id) = self.session_id.lock().await.clone() {
            request = request.header(SESSION_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Auth(format!(
                "{} rejected the credential ({})",
                self.url, status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "{} returned {}: {}",
                self.url, status, body
            )));
        }

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(id.to_string());
        }

        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("Failed to read response body: {}", e)))?;

        let messages = if is_event_stream {
            parse_event_stream(&body)
        } else {
            vec![body.trim().to_string()]
        };

        for message in messages.into_iter().filter(|m| !m.is_empty()) {
            debug!(url = %self.url, "Received: {}", message);
            if inbox.send(message).is_err() {
                debug!("Inbox closed, dropping message");
            }
        }

        Ok(())
    }

    async fn recv(&self) -> Result<Option<String>> {
        Ok(self.inbox_rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        if self.inbox_tx.lock().await.take().is_none() {
            return Ok(());
        }

        // Servers that issued a session id expect it to be released.
        if let Some(id) = self.session_id.lock().await.take() {
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, id)
                .bearer_auth(&self.credential)
                .send()
                .await;
            if let Err(e) = result {
                warn!(url = %self.url, error = %e, "Failed to release HTTP session");
            }
        }

        Ok(())
    }
}

/// Extract the `data:` payload of each event in a `text/event-stream` body.
fn parse_event_stream(body: &str) -> Vec<String> {
    let mut events = Vec::new();
    let mut data: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.trim().is_empty() {
            if !data.is_empty() {
                events.push(data.join("\n"));
                data.clear();
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if !data.is_empty() {
        events.push(data.join("\n"));
    }

    events
}
