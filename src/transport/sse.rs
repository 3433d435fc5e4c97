//! Server-Sent Events decoding
//!
//! Bytes arrive in arbitrary chunks. [`LineDecoder`] reassembles them into
//! lines, [`EventParser`] folds lines into [`SseEvent`]s, and the stream
//! adapters ([`lines`], [`events`], [`messages`]) wire the two onto an async
//! body.

use std::pin::Pin;

use async_stream::try_stream;
use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use tracing::{debug, trace};

use crate::protocol::JsonRpcMessage;
use crate::{Error, Result};

/// Event type used when a record carries no `event:` field
pub const DEFAULT_EVENT_TYPE: &str = "message";

/// Event type of the legacy transport's first record
pub const ENDPOINT_EVENT_TYPE: &str = "endpoint";

/// Lazy sequence of raw lines
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Lazy sequence of decoded events
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SseEvent>> + Send>>;

/// Lazy sequence of JSON-RPC messages carried by `message` events
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<JsonRpcMessage>> + Send>>;

/// A parsed SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type (`message` unless the server said otherwise)
    pub event_type: String,
    /// Data lines joined with `\n`
    pub data: String,
    /// Last `id:` seen in the record
    pub id: Option<String>,
    /// Reconnection delay hint in milliseconds
    pub retry: Option<u64>,
}

impl SseEvent {
    /// Event with the default type
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event_type: DEFAULT_EVENT_TYPE.to_string(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Whether the event carries a JSON-RPC message
    #[must_use]
    pub fn is_message(&self) -> bool {
        self.event_type == DEFAULT_EVENT_TYPE
    }
}

/// Splits a chunked byte stream into lines
///
/// Lines end in `\n`; a trailing `\r` is dropped. Bytes are buffered until the
/// terminator arrives, so multi-byte UTF-8 sequences split across chunks
/// decode intact.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    /// Feed a chunk, returning every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos);
            self.buf.advance(1);
            lines.push(decode_line(&line));
        }
        lines
    }

    /// Flush an unterminated final line at end of stream
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = self.buf.split();
        Some(decode_line(&line))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Folds lines into events
#[derive(Debug, Default)]
pub struct EventParser {
    event_type: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    pending: bool,
}

impl EventParser {
    /// Consume one line; a blank line emits the pending event
    pub fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let Some((field, value)) = line.split_once(':') else {
            trace!(line = %line, "Ignoring SSE line without field separator");
            return None;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event_type = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "retry" => match value.parse() {
                Ok(ms) => self.retry = Some(ms),
                Err(_) => return None,
            },
            _ => {
                trace!(field = %field, "Ignoring unknown SSE field");
                return None;
            }
        }
        self.pending = true;
        None
    }

    fn flush(&mut self) -> Option<SseEvent> {
        if !std::mem::take(&mut self.pending) {
            return None;
        }
        Some(SseEvent {
            event_type: self
                .event_type
                .take()
                .unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
            retry: self.retry.take(),
        })
    }
}

/// Turn a chunked byte body into lines
pub fn lines<S, B, E>(body: S) -> LineStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    Box::pin(try_stream! {
        let mut decoder = LineDecoder::default();
        let mut body = Box::pin(body);

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Connection(format!("Failed to read event stream: {e}")))?;
            for line in decoder.push(chunk.as_ref()) {
                yield line;
            }
        }
        if let Some(line) = decoder.finish() {
            yield line;
        }
    })
}

/// Turn lines into events
///
/// An event still pending when the lines run out is discarded, since no blank
/// line ever completed it.
pub fn events(mut lines: LineStream) -> EventStream {
    Box::pin(try_stream! {
        let mut parser = EventParser::default();
        while let Some(line) = lines.next().await {
            if let Some(event) = parser.push_line(&line?) {
                yield event;
            }
        }
    })
}

/// Decode a chunked byte body straight into events
pub fn decode<S, B, E>(body: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    events(lines(body))
}

/// Extract JSON-RPC messages from `message` events
///
/// Other event types and empty priming events are skipped. A `message` event
/// whose data is not a JSON-RPC message is a protocol error.
pub fn messages(mut events: EventStream) -> MessageStream {
    Box::pin(try_stream! {
        while let Some(event) = events.next().await {
            let event = event?;
            if !event.is_message() {
                debug!(event_type = %event.event_type, "Skipping non-message SSE event");
                continue;
            }
            if event.data.trim().is_empty() {
                continue;
            }
            let message: JsonRpcMessage = serde_json::from_str(&event.data).map_err(|e| {
                Error::Protocol(format!("Malformed JSON-RPC message in SSE data: {e}"))
            })?;
            yield message;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pretty_assertions::assert_eq;

    const WIRE: &str = "event: endpoint\ndata: /message?sessionId=abc123\n\n\
: keep-alive\n\n\
id: 7\ndata: {\"jsonrpc\":\"2.0\",\n\
data: \"method\":\"notifications/progress\"}\n\n\
event: message\r\ndata: héllo wörld\r\n\r\n\
garbage line\n\
retry: 3000\ndata:\n\n";

    fn parse_chunks(chunks: &[&[u8]]) -> Vec<SseEvent> {
        let mut decoder = LineDecoder::default();
        let mut parser = EventParser::default();
        let mut out = Vec::new();
        for chunk in chunks {
            for line in decoder.push(chunk) {
                out.extend(parser.push_line(&line));
            }
        }
        if let Some(line) = decoder.finish() {
            out.extend(parser.push_line(&line));
        }
        out
    }

    fn expected() -> Vec<SseEvent> {
        vec![
            SseEvent {
                event_type: "endpoint".to_string(),
                data: "/message?sessionId=abc123".to_string(),
                id: None,
                retry: None,
            },
            SseEvent {
                event_type: "message".to_string(),
                data: "{\"jsonrpc\":\"2.0\",\n\"method\":\"notifications/progress\"}".to_string(),
                id: Some("7".to_string()),
                retry: None,
            },
            SseEvent::message("héllo wörld"),
            SseEvent {
                event_type: "message".to_string(),
                data: String::new(),
                id: None,
                retry: Some(3000),
            },
        ]
    }

    #[test]
    fn parses_whole_buffer() {
        assert_eq!(parse_chunks(&[WIRE.as_bytes()]), expected());
    }

    #[test]
    fn chunking_invariance_at_every_split_point() {
        let bytes = WIRE.as_bytes();
        for split in 0..=bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(parse_chunks(&[a, b]), expected(), "split at {split}");
        }
    }

    #[test]
    fn chunking_invariance_byte_by_byte() {
        let chunks: Vec<&[u8]> = WIRE.as_bytes().chunks(1).collect();
        assert_eq!(parse_chunks(&chunks), expected());
    }

    #[test]
    fn consecutive_blank_lines_emit_nothing_extra() {
        let events = parse_chunks(&[&b"\n\n\ndata: x\n\n\n\n"[..]]);
        assert_eq!(events, vec![SseEvent::message("x")]);
    }

    #[test]
    fn unterminated_event_is_discarded() {
        let events = parse_chunks(&[&b"data: first\n\ndata: second"[..]]);
        assert_eq!(events, vec![SseEvent::message("first")]);
    }

    #[test]
    fn only_one_leading_space_is_stripped() {
        let events = parse_chunks(&[&b"data:  indented\ndata:tight\n\n"[..]]);
        assert_eq!(events[0].data, " indented\ntight");
    }

    #[tokio::test]
    async fn stream_adapters_match_sync_parser() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = WIRE
            .as_bytes()
            .chunks(5)
            .map(|c| Ok(c.to_vec()))
            .collect();
        let decoded: Vec<SseEvent> = decode(stream::iter(chunks))
            .map(|e| e.unwrap())
            .collect()
            .await;
        assert_eq!(decoded, expected());
    }

    #[tokio::test]
    async fn read_failure_surfaces_as_connection_error() {
        let chunks: Vec<std::result::Result<&'static [u8], String>> =
            vec![Ok(&b"data: a\n\n"[..]), Err("reset by peer".to_string())];
        let mut events = decode(stream::iter(chunks));
        assert_eq!(events.next().await.unwrap().unwrap(), SseEvent::message("a"));
        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
    }

    #[tokio::test]
    async fn messages_skip_endpoint_and_priming_events() {
        let body = "event: endpoint\ndata: /message?sessionId=s\n\n\
id: 1\ndata:\n\n\
data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{}}\n\n";
        let chunks: Vec<std::result::Result<&'static [u8], std::io::Error>> = vec![Ok(body.as_bytes())];
        let all: Vec<JsonRpcMessage> = messages(decode(stream::iter(chunks)))
            .map(|m| m.unwrap())
            .collect()
            .await;
        assert_eq!(all.len(), 1);
        assert!(all[0].is_response());
    }

    #[tokio::test]
    async fn malformed_message_is_protocol_error() {
        let chunks: Vec<std::result::Result<&'static [u8], std::io::Error>> =
            vec![Ok(&b"data: not json\n\n"[..])];
        let mut stream = messages(decode(stream::iter(chunks)));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
