//! HTTP client for MCP endpoints
//!
//! Knows how to open an event stream and post a body. Knows nothing about
//! MCP semantics beyond the headers every request must carry.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, trace};
use url::Url;

use super::sse::{self, LineStream};
use crate::config::Config;
use crate::protocol::JsonRpcMessage;
use crate::{Error, Result};

/// Session header used by Streamable HTTP
pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
/// Negotiated protocol version header
pub const HEADER_PROTOCOL_VERSION: &str = "MCP-Protocol-Version";
/// SSE media type
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
/// JSON media type
pub const JSON_MIME_TYPE: &str = "application/json";

/// Accept header required by the Streamable HTTP transport, sent on every request
const MCP_ACCEPT: &str = "application/json, text/event-stream";

/// What came back from a POST
pub enum Reply {
    /// `application/json`: exactly one message
    Message(JsonRpcMessage),
    /// `text/event-stream`: a finite stream of messages
    Stream(sse::MessageStream),
    /// Body carries no message; the reply travels on another stream
    Accepted(StatusCode),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Message(m) => f.debug_tuple("Message").field(m).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
            Self::Accepted(s) => f.debug_tuple("Accepted").field(s).finish(),
        }
    }
}

/// Shared HTTP client with the probe's default headers baked in
#[derive(Clone, Debug)]
pub struct HttpClient {
    client: Client,
    headers: HeaderMap,
    request_timeout: Duration,
}

impl HttpClient {
    /// Create a client
    ///
    /// No overall timeout is set on the underlying client: event streams stay
    /// open indefinitely. POSTs are bounded by `request_timeout`.
    pub fn new(
        custom_headers: &HashMap<String, String>,
        connect_timeout: Duration,
        request_timeout: Duration,
        protocol_version: &str,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Connection(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("mcp-protocol-version"),
            HeaderValue::from_str(protocol_version)
                .map_err(|e| Error::Config(format!("Invalid protocol version: {e}")))?,
        );
        for (key, value) in custom_headers {
            let name = key
                .parse::<HeaderName>()
                .map_err(|e| Error::Config(format!("Invalid header name '{key}': {e}")))?;
            let value = value
                .parse::<HeaderValue>()
                .map_err(|e| Error::Config(format!("Invalid value for header '{key}': {e}")))?;
            headers.insert(name, value);
        }

        Ok(Self {
            client,
            headers,
            request_timeout,
        })
    }

    /// Create a client from loaded configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            &config.server.headers,
            config.timeouts.connect,
            config.timeouts.request,
            &config.client.protocol_version,
        )
    }

    fn headers_for(&self, accept: &'static str, session: Option<&str>) -> Result<HeaderMap> {
        let mut headers = self.headers.clone();
        headers.insert(header::ACCEPT, HeaderValue::from_static(accept));
        if let Some(id) = session {
            let value = HeaderValue::from_str(id)
                .map_err(|e| Error::Protocol(format!("Session id is not a valid header value: {e}")))?;
            headers.insert(HeaderName::from_static("mcp-session-id"), value);
        }
        Ok(headers)
    }

    /// Open a long-lived event stream
    pub async fn open_stream(&self, url: &Url, session: Option<&str>) -> Result<LineStream> {
        debug!(url = %url, session_id = ?session, "Opening event stream");

        let response = self
            .client
            .get(url.clone())
            .headers(self.headers_for(MCP_ACCEPT, session)?)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("Event stream connection to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body, session));
        }

        Ok(sse::lines(response.bytes_stream()))
    }

    /// POST a JSON body
    pub async fn post<T>(&self, url: &Url, session: Option<&str>, body: &T) -> Result<PostResponse>
    where
        T: Serialize + ?Sized,
    {
        let mut headers = self.headers_for(MCP_ACCEPT, session)?;
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE));

        if tracing::enabled!(tracing::Level::TRACE) {
            trace!(url = %url, body = %serde_json::to_string(body)?, "POST");
        }

        let response = self
            .client
            .post(url.clone())
            .headers(headers)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("POST {url} failed: {e}")))?;

        Ok(PostResponse {
            status: response.status(),
            headers: response.headers().clone(),
            session: session.map(str::to_string),
            body: response,
        })
    }

    /// Terminate a Streamable HTTP session
    pub async fn delete(&self, url: &Url, session: &str) -> Result<StatusCode> {
        let response = self
            .client
            .delete(url.clone())
            .headers(self.headers_for(MCP_ACCEPT, Some(session))?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::Connection(format!("DELETE {url} failed: {e}")))?;
        Ok(response.status())
    }
}

fn status_error(status: StatusCode, body: &str, session: Option<&str>) -> Error {
    if status == StatusCode::NOT_FOUND {
        return Error::SessionNotFound(format!(
            "{} (HTTP 404: {})",
            session.unwrap_or("<none>"),
            body.trim()
        ));
    }
    Error::Protocol(format!("HTTP {status}: {}", body.trim()))
}

/// Response to a POST: status, headers and an unread body
#[derive(Debug)]
pub struct PostResponse {
    status: StatusCode,
    headers: HeaderMap,
    session: Option<String>,
    body: reqwest::Response,
}

impl PostResponse {
    /// HTTP status
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Response headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `Mcp-Session-Id` assigned by the server, if any
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.headers
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
    }

    /// Session named in error messages when the id travels outside the headers
    #[must_use]
    pub fn for_session(mut self, session_id: &str) -> Self {
        self.session = Some(session_id.to_string());
        self
    }

    /// `Content-Type` without parameters, lowercased
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
    }

    /// Fail on non-2xx; 404 means the session is gone
    pub async fn error_for_status(self) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        let status = self.status;
        let session = self.session.clone();
        let body = self.body.text().await.unwrap_or_default();
        Err(status_error(status, &body, session.as_deref()))
    }

    /// Read the whole body as text
    pub async fn text(self) -> Result<String> {
        self.body
            .text()
            .await
            .map_err(|e| Error::Connection(format!("Failed to read response body: {e}")))
    }

    /// Interpret the body by `Content-Type`
    pub async fn into_reply(self) -> Result<Reply> {
        if matches!(self.status, StatusCode::ACCEPTED | StatusCode::NO_CONTENT) {
            return Ok(Reply::Accepted(self.status));
        }

        let content_type = self.content_type();
        match content_type.as_deref() {
            Some(JSON_MIME_TYPE) => {
                let bytes = self
                    .body
                    .bytes()
                    .await
                    .map_err(|e| Error::Connection(format!("Failed to read response body: {e}")))?;
                let message = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Protocol(format!("Failed to parse JSON response: {e}")))?;
                Ok(Reply::Message(message))
            }
            Some(EVENT_STREAM_MIME_TYPE) => Ok(Reply::Stream(sse::messages(sse::decode(
                self.body.bytes_stream(),
            )))),
            other => {
                debug!(status = %self.status, content_type = ?other, "POST reply carries no message");
                Ok(Reply::Accepted(self.status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_headers_are_validated() {
        let mut headers = HashMap::new();
        headers.insert("X-Trace".to_string(), "probe".to_string());
        assert!(
            HttpClient::new(&headers, Duration::from_secs(1), Duration::from_secs(1), "2025-06-18")
                .is_ok()
        );

        headers.insert("bad header".to_string(), "x".to_string());
        let err =
            HttpClient::new(&headers, Duration::from_secs(1), Duration::from_secs(1), "2025-06-18")
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn not_found_maps_to_session_not_found() {
        let err = status_error(StatusCode::NOT_FOUND, "Session not found", Some("abc"));
        assert!(matches!(err, Error::SessionNotFound(ref m) if m.contains("abc")));

        let err = status_error(StatusCode::BAD_REQUEST, "bad", None);
        assert!(matches!(err, Error::Protocol(_)));
    }

    fn response_with(content_type: &str) -> PostResponse {
        let response = axum::http::Response::builder()
            .status(200)
            .header(header::CONTENT_TYPE, content_type)
            .header(HEADER_SESSION_ID, "s1")
            .body(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .unwrap();
        let body = reqwest::Response::from(response);
        PostResponse {
            status: body.status(),
            headers: body.headers().clone(),
            session: None,
            body,
        }
    }

    #[tokio::test]
    async fn content_type_match_ignores_case_and_parameters() {
        let json = response_with("Application/JSON; charset=utf-8");
        assert_eq!(json.content_type().as_deref(), Some(JSON_MIME_TYPE));
        assert!(matches!(json.into_reply().await.unwrap(), Reply::Message(_)));

        let stream = response_with("Text/Event-Stream");
        assert_eq!(stream.content_type().as_deref(), Some(EVENT_STREAM_MIME_TYPE));
        assert!(matches!(stream.into_reply().await.unwrap(), Reply::Stream(_)));
    }

    #[tokio::test]
    async fn session_label_appears_in_not_found_errors() {
        let response = axum::http::Response::builder()
            .status(404)
            .body("Session not found")
            .unwrap();
        let body = reqwest::Response::from(response);
        let response = PostResponse {
            status: body.status(),
            headers: body.headers().clone(),
            session: None,
            body,
        }
        .for_session("legacy-1");
        let err = response.error_for_status().await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(ref m) if m.starts_with("legacy-1 ")));
    }

    #[test]
    fn session_header_is_attached() {
        let client = HttpClient::new(
            &HashMap::new(),
            Duration::from_secs(1),
            Duration::from_secs(1),
            "2025-06-18",
        )
        .unwrap();
        let headers = client.headers_for(MCP_ACCEPT, Some("sess-1")).unwrap();
        assert_eq!(headers.get(HEADER_SESSION_ID).unwrap(), "sess-1");
        assert_eq!(headers.get(header::ACCEPT).unwrap(), MCP_ACCEPT);
        assert_eq!(headers.get(HEADER_PROTOCOL_VERSION).unwrap(), "2025-06-18");

        let headers = client.headers_for(MCP_ACCEPT, None).unwrap();
        assert!(headers.get(HEADER_SESSION_ID).is_none());
    }
}
