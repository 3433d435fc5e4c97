//! Transport implementations for MCP sessions

mod client;
mod legacy;
mod sse;
mod streamable;

pub use self::client::{
    EVENT_STREAM_MIME_TYPE, HEADER_PROTOCOL_VERSION, HEADER_SESSION_ID, HttpClient, JSON_MIME_TYPE,
    PostResponse, Reply,
};
pub use self::legacy::SseTransport;
pub use self::sse::{
    DEFAULT_EVENT_TYPE, ENDPOINT_EVENT_TYPE, EventParser, EventStream, LineDecoder, LineStream,
    MessageStream, SseEvent, decode, events, lines, messages,
};
pub use self::streamable::StreamableHttpTransport;

use async_trait::async_trait;

use crate::Result;
use crate::protocol::JsonRpcMessage;
use crate::session::{Session, TransportKind};

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send {
    /// Post one outbound message and hand back whatever the POST returned
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<Reply>;

    /// Next message on the session's long-lived event stream
    ///
    /// `Ok(None)` once the stream has closed.
    async fn next_message(&mut self) -> Result<Option<JsonRpcMessage>>;

    /// Established session, if any yet
    fn session(&self) -> Option<&Session>;

    /// Transport variant
    fn kind(&self) -> TransportKind;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;

    /// Close the transport
    async fn close(&mut self) -> Result<()>;
}
