//! Legacy HTTP+SSE transport
//!
//! 1. GET /sse establishes the stream and announces the session endpoint
//! 2. POST to the session endpoint (`/message?sessionId=XXX`) for requests
//! 3. Responses and notifications arrive on the same SSE stream

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};
use url::Url;

use super::sse::{self, MessageStream};
use super::{HttpClient, Reply, Transport};
use crate::protocol::JsonRpcMessage;
use crate::session::{Session, TransportKind, negotiate_legacy};
use crate::{Error, Result};

/// Legacy SSE transport: one GET stream, POSTs to the announced endpoint
pub struct SseTransport {
    http: HttpClient,
    session: Option<Session>,
    message_url: Url,
    listener: Option<MessageStream>,
}

impl SseTransport {
    /// Open `/sse`, negotiate the session and keep the stream for replies
    pub async fn connect(http: HttpClient, sse_url: &Url, endpoint_wait: Duration) -> Result<Self> {
        debug!(url = %sse_url, "Establishing SSE connection");

        let mut events = sse::events(http.open_stream(sse_url, None).await?);
        let session = negotiate_legacy(&mut events, sse_url, endpoint_wait).await?;
        let message_url = session
            .message_endpoint()
            .cloned()
            .ok_or_else(|| Error::Protocol("Legacy session without message endpoint".to_string()))?;

        Ok(Self {
            http,
            session: Some(session),
            message_url,
            listener: Some(sse::messages(events)),
        })
    }

    /// The session is bound to its `/sse` stream: losing one loses both
    fn drop_session(&mut self) {
        self.session = None;
        self.listener = None;
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<Reply> {
        let Some(session_id) = self.session.as_ref().map(|s| s.id().to_string()) else {
            return Err(Error::Connection(format!(
                "Session at {} is closed",
                self.message_url
            )));
        };

        let response = self
            .http
            .post(&self.message_url, None, message)
            .await?
            .for_session(&session_id);
        match response.error_for_status().await {
            Ok(response) => response.into_reply().await,
            Err(e) => {
                if matches!(e, Error::SessionNotFound(_)) {
                    info!(session_id = %session_id, "Server dropped the session");
                    self.drop_session();
                }
                Err(e)
            }
        }
    }

    async fn next_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        let Some(listener) = self.listener.as_mut() else {
            return Ok(None);
        };
        match listener.next().await {
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => {
                self.drop_session();
                Err(e)
            }
            None => {
                debug!(
                    session_id = %self.session.as_ref().map_or("", Session::id),
                    "SSE stream closed"
                );
                self.drop_session();
                Ok(None)
            }
        }
    }

    fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        self.drop_session();
        Ok(())
    }
}
