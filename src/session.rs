//! Session negotiation
//!
//! Legacy SSE servers announce the posting endpoint in the first event of the
//! `/sse` stream. Streamable HTTP servers assign the session in the
//! `Mcp-Session-Id` header of the first POST.

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::transport::{ENDPOINT_EVENT_TYPE, EventStream};
use crate::{Error, Result};

/// Query parameters that may carry the legacy session id
const SESSION_QUERY_KEYS: &[&str] = &["sessionId", "session_id"];

/// Transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// GET `/sse` + POST `/message?sessionId=`
    #[serde(alias = "sse-legacy")]
    Sse,
    /// POST/GET `/mcp` keyed by `Mcp-Session-Id`
    #[serde(alias = "streamable")]
    StreamableHttp,
}

impl TransportKind {
    /// Guess the transport from the endpoint path
    #[must_use]
    pub fn infer(url: &Url) -> Self {
        if url.path().trim_end_matches('/').ends_with("/sse") {
            Self::Sse
        } else {
            Self::StreamableHttp
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sse => f.write_str("sse"),
            Self::StreamableHttp => f.write_str("streamable-http"),
        }
    }
}

/// An established MCP session
///
/// Immutable once created. Dropped when the connection closes or the server
/// reports the session as unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session_id: String,
    transport: TransportKind,
    message_endpoint: Option<Url>,
}

impl Session {
    /// Legacy session from the endpoint announced on `/sse`
    ///
    /// `endpoint` may be relative (`/message?sessionId=abc`) or absolute.
    pub fn legacy(base: &Url, endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(Error::Protocol("Empty endpoint event".to_string()));
        }
        let resolved = base
            .join(endpoint)
            .map_err(|e| Error::Protocol(format!("Unparsable endpoint '{endpoint}': {e}")))?;
        Self::from_message_url(resolved)
    }

    /// Legacy session from a full message URL
    pub fn from_message_url(url: Url) -> Result<Self> {
        let session_id = url
            .query_pairs()
            .find(|(k, _)| SESSION_QUERY_KEYS.contains(&k.as_ref()))
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Protocol(format!("No sessionId in endpoint {url}")))?;

        Ok(Self {
            session_id,
            transport: TransportKind::Sse,
            message_endpoint: Some(url),
        })
    }

    /// Streamable HTTP session from an `Mcp-Session-Id` header value
    pub fn streamable(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            transport: TransportKind::StreamableHttp,
            message_endpoint: None,
        }
    }

    /// Server-assigned session id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Transport variant the session lives on
    #[must_use]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Where JSON-RPC messages are posted (legacy only)
    #[must_use]
    pub fn message_endpoint(&self) -> Option<&Url> {
        self.message_endpoint.as_ref()
    }
}

/// Read the endpoint event from a freshly opened `/sse` stream
///
/// The stream stays usable afterwards: later events carry the session's
/// responses and notifications.
pub async fn negotiate_legacy(events: &mut EventStream, base: &Url, wait: Duration) -> Result<Session> {
    let deadline = tokio::time::Instant::now() + wait;
    let first = loop {
        let event = tokio::time::timeout_at(deadline, events.next())
            .await
            .map_err(|_| {
                Error::Protocol(format!(
                    "No endpoint event from {base} within {}ms",
                    wait.as_millis()
                ))
            })?
            .ok_or_else(|| {
                Error::Protocol(format!("SSE stream from {base} closed before endpoint event"))
            })??;
        // `retry:`/`id:`-only records carry no endpoint
        if event.data.trim().is_empty() {
            trace!(event_type = %event.event_type, "Skipping SSE record without data");
            continue;
        }
        break event;
    };

    if first.event_type != ENDPOINT_EVENT_TYPE {
        warn!(event_type = %first.event_type, "First SSE event is not an endpoint event");
    }
    debug!(endpoint = %first.data, "Received message endpoint from SSE");

    let session = Session::legacy(base, &first.data)?;
    info!(
        session_id = %session.id(),
        message_url = %session.message_endpoint().map_or(String::new(), Url::to_string),
        "SSE handshake complete"
    );
    Ok(session)
}

/// What the CLI was pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A server endpoint to run a full session against
    Server(Url),
    /// An already negotiated legacy session (message URL or bare session id)
    Attach(Session),
}

impl Target {
    /// Interpret a positional argument
    ///
    /// Anything with a scheme is a URL; a URL carrying `sessionId` attaches to
    /// that session. A bare token is a session id posted against `base`.
    pub fn parse(arg: &str, base: &Url) -> Result<Self> {
        let arg = arg.trim();
        if arg.is_empty() {
            return Err(Error::Config("Empty target".to_string()));
        }

        if arg.contains("://") {
            let url = Url::parse(arg)?;
            if url
                .query_pairs()
                .any(|(k, _)| SESSION_QUERY_KEYS.contains(&k.as_ref()))
            {
                return Session::from_message_url(url).map(Self::Attach);
            }
            return Ok(Self::Server(url));
        }

        let mut url = base.join("/message")?;
        url.query_pairs_mut().append_pair("sessionId", arg);
        Session::from_message_url(url).map(Self::Attach)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{SseEvent, decode};
    use futures::stream;

    fn base() -> Url {
        Url::parse("http://localhost:3001/sse").unwrap()
    }

    #[test]
    fn legacy_endpoint_yields_session_and_absolute_url() {
        let session = Session::legacy(&base(), "/message?sessionId=abc123").unwrap();
        assert_eq!(session.id(), "abc123");
        assert_eq!(session.transport(), TransportKind::Sse);
        assert_eq!(
            session.message_endpoint().unwrap().as_str(),
            "http://localhost:3001/message?sessionId=abc123"
        );
    }

    #[test]
    fn legacy_endpoint_accepts_snake_case_and_absolute() {
        let session =
            Session::legacy(&base(), "http://127.0.0.1:9000/messages/?session_id=f00d").unwrap();
        assert_eq!(session.id(), "f00d");
        assert_eq!(
            session.message_endpoint().unwrap().as_str(),
            "http://127.0.0.1:9000/messages/?session_id=f00d"
        );
    }

    #[test]
    fn legacy_endpoint_without_session_is_protocol_error() {
        let err = Session::legacy(&base(), "/message").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let err = Session::legacy(&base(), "  ").unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn transport_inferred_from_path() {
        assert_eq!(TransportKind::infer(&base()), TransportKind::Sse);
        assert_eq!(
            TransportKind::infer(&Url::parse("http://localhost:3001/mcp").unwrap()),
            TransportKind::StreamableHttp
        );
        assert_eq!(TransportKind::StreamableHttp.to_string(), "streamable-http");
    }

    #[test]
    fn target_parsing() {
        assert_eq!(
            Target::parse("http://localhost:3001/mcp", &base()).unwrap(),
            Target::Server(Url::parse("http://localhost:3001/mcp").unwrap())
        );

        let Target::Attach(session) =
            Target::parse("http://localhost:3001/message?sessionId=xyz", &base()).unwrap()
        else {
            panic!("expected attach target");
        };
        assert_eq!(session.id(), "xyz");

        let Target::Attach(session) = Target::parse("abc123", &base()).unwrap() else {
            panic!("expected attach target");
        };
        assert_eq!(
            session.message_endpoint().unwrap().as_str(),
            "http://localhost:3001/message?sessionId=abc123"
        );
    }

    #[tokio::test]
    async fn negotiation_reads_first_event_and_leaves_stream_open() {
        let body = "event: endpoint\ndata: /message?sessionId=abc123\n\n\
data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n\n";
        let chunks: Vec<std::result::Result<&'static [u8], std::io::Error>> = vec![Ok(body.as_bytes())];
        let mut events = decode(stream::iter(chunks));

        let session = negotiate_legacy(&mut events, &base(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.id(), "abc123");

        let next: SseEvent = events.next().await.unwrap().unwrap();
        assert!(next.is_message());
    }

    #[tokio::test]
    async fn negotiation_skips_records_without_data() {
        let body = "retry: 3000\n\nid: 7\n\nevent: endpoint\ndata: /message?sessionId=abc123\n\n";
        let chunks: Vec<std::result::Result<&'static [u8], std::io::Error>> = vec![Ok(body.as_bytes())];
        let mut events = decode(stream::iter(chunks));

        let session = negotiate_legacy(&mut events, &base(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(session.id(), "abc123");
    }

    #[tokio::test]
    async fn negotiation_times_out_without_endpoint() {
        let mut events: EventStream = Box::pin(stream::pending());
        let err = negotiate_legacy(&mut events, &base(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn negotiation_fails_on_closed_stream() {
        let mut events: EventStream = Box::pin(stream::empty());
        let err = negotiate_legacy(&mut events, &base(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed before endpoint"));
    }
}
