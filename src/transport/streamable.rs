//! Streamable HTTP transport
//!
//! POST /mcp carries every client message; the reply is JSON or an SSE stream
//! depending on `Content-Type`. The server assigns `Mcp-Session-Id` on the
//! first POST and expects it back on every later request. GET /mcp opens an
//! optional stream for server-initiated traffic.

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};
use url::Url;

use super::sse::{self, MessageStream};
use super::{HttpClient, Reply, Transport};
use crate::protocol::JsonRpcMessage;
use crate::session::{Session, TransportKind};
use crate::{Error, Result};

/// Streamable HTTP transport
pub struct StreamableHttpTransport {
    http: HttpClient,
    endpoint: Url,
    session: Option<Session>,
    listener: Option<MessageStream>,
    connected: bool,
}

impl StreamableHttpTransport {
    /// Create a transport; nothing is sent until the first message
    pub fn new(http: HttpClient, endpoint: Url) -> Self {
        info!(url = %endpoint, "Streamable HTTP mode - direct POST");
        Self {
            http,
            endpoint,
            session: None,
            listener: None,
            connected: true,
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id().to_string())
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.listener = None;
        self.connected = false;
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<Reply> {
        if !self.connected {
            return Err(Error::Connection("Streamable HTTP session is closed".to_string()));
        }

        let session_id = self.session_id();
        if session_id.is_none() {
            debug!(method = ?message.method(), "Sending without session ID");
        }

        let response = self
            .http
            .post(&self.endpoint, session_id.as_deref(), message)
            .await?;
        let response = match response.error_for_status().await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, Error::SessionNotFound(_)) && session_id.is_some() {
                    info!(session_id = ?session_id, "Server dropped the session");
                    self.drop_session();
                }
                return Err(e);
            }
        };

        if let Some(returned) = response.session_id().map(str::to_string) {
            match self.session_id() {
                None => {
                    info!(session_id = %returned, url = %self.endpoint, "Stored session ID from response");
                    self.session = Some(Session::streamable(returned));
                }
                Some(current) if current != returned => {
                    warn!(current = %current, returned = %returned, "Server returned a different session ID; keeping the original");
                }
                Some(_) => {}
            }
        }

        response.into_reply().await
    }

    async fn next_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        if !self.connected {
            return Ok(None);
        }
        if self.listener.is_none() {
            let session_id = self.session_id();
            let lines = self.http.open_stream(&self.endpoint, session_id.as_deref()).await?;
            self.listener = Some(sse::messages(sse::events(lines)));
        }

        let Some(listener) = self.listener.as_mut() else {
            return Ok(None);
        };
        match listener.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.listener = None;
                Err(e)
            }
            None => {
                debug!("GET stream closed");
                self.listener = None;
                Ok(None)
            }
        }
    }

    fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(id) = self.session_id() {
            match self.http.delete(&self.endpoint, &id).await {
                Ok(status) => debug!(session_id = %id, status = %status, "Session terminated"),
                Err(e) => debug!(session_id = %id, error = %e, "Session termination failed"),
            }
        }
        self.drop_session();
        Ok(())
    }
}
