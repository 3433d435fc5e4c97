//! JSON-RPC message driver
//!
//! Sends requests over a [`Transport`], correlates the response by id and
//! collects whatever the server sent in between. Requests run one at a time.

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::Config;
use crate::error::rpc_codes;
use crate::protocol::{
    ClientCapabilities, ElicitationCreateResult, Info, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    ProgressParams, ProgressToken, RequestId, Resource, ResourcesListParams, ResourcesListResult,
    Root, RootsListResult, Tool, ToolsCallParams, ToolsCallResult, ToolsListParams,
    ToolsListResult, is_supported_version, methods,
};
use crate::session::{Session, TransportKind};
use crate::transport::{HttpClient, Reply, SseTransport, StreamableHttpTransport, Transport};
use crate::{Error, Result};

/// How the client presents itself to the server
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `clientInfo`
    pub client_info: Info,
    /// Requested protocol version
    pub protocol_version: String,
    /// Declared capabilities
    pub capabilities: ClientCapabilities,
    /// Answer to `roots/list`
    pub roots: Vec<Root>,
    /// Bound on waiting for a correlated response
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_info: Info {
                name: "mcp-probe".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
            },
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::probe(),
            roots: Vec::new(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl ClientOptions {
    /// Build options from loaded configuration
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            client_info: Info {
                name: config.client.name.clone(),
                version: config.client.version.clone(),
                title: None,
            },
            protocol_version: config.client.protocol_version.clone(),
            capabilities: ClientCapabilities::probe(),
            roots: config.client.roots.clone(),
            request_timeout: config.timeouts.request,
        }
    }

    /// Params of the `initialize` request
    #[must_use]
    pub fn initialize_params(&self) -> InitializeParams {
        InitializeParams {
            protocol_version: self.protocol_version.clone(),
            capabilities: self.capabilities.clone(),
            client_info: self.client_info.clone(),
        }
    }
}

/// One request, its response and everything that arrived in between
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Request as sent
    pub request: JsonRpcRequest,
    /// Correlated terminal response
    pub response: JsonRpcResponse,
    /// Notifications received before the response, in arrival order
    pub notifications: Vec<JsonRpcNotification>,
}

impl Exchange {
    /// Request id
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.request.id
    }

    /// Progress notifications carrying this request's token
    ///
    /// Empty when the request carried no token.
    #[must_use]
    pub fn progress(&self) -> Vec<ProgressParams> {
        let Some(token) = self.request.progress_token() else {
            return Vec::new();
        };
        self.notifications
            .iter()
            .filter_map(JsonRpcNotification::as_progress)
            .filter(|p| p.progress_token == token)
            .collect()
    }

    /// Whether the server answered with an `error` object
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.response.error.is_some()
    }

    /// `result`, or the server's error as [`Error::Application`]
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.response.error {
            return Err(error.into());
        }
        self.response.result.ok_or_else(|| {
            Error::Protocol(format!("Response to {} has no result", self.request.id))
        })
    }

    /// Deserialize `result` into a typed value
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T> {
        let method = self.request.method.clone();
        let value = self.into_result()?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("Malformed {method} result: {e}")))
    }
}

/// Outcome of `tools/call`
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Tool output
    pub result: ToolsCallResult,
    /// Progress notifications correlated by token
    pub progress: Vec<ProgressParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Phase {
    Fresh,
    Initialized,
    Ready,
}

/// MCP client session driver
pub struct McpClient {
    transport: Box<dyn Transport>,
    options: ClientOptions,
    next_id: i64,
    phase: Phase,
    server: Option<InitializeResult>,
}

impl McpClient {
    /// Wrap an already connected transport
    #[must_use]
    pub fn new(transport: Box<dyn Transport>, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            next_id: 1,
            phase: Phase::Fresh,
            server: None,
        }
    }

    /// Connect to `url` over the given transport
    ///
    /// Legacy SSE negotiates the session here; Streamable HTTP gets its
    /// session from the `initialize` response.
    pub async fn connect(
        http: HttpClient,
        url: &Url,
        kind: TransportKind,
        options: ClientOptions,
        endpoint_wait: Duration,
    ) -> Result<Self> {
        let transport: Box<dyn Transport> = match kind {
            TransportKind::Sse => Box::new(SseTransport::connect(http, url, endpoint_wait).await?),
            TransportKind::StreamableHttp => Box::new(StreamableHttpTransport::new(http, url.clone())),
        };
        Ok(Self::new(transport, options))
    }

    /// Established session, if any yet
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.transport.session()
    }

    /// Transport variant
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Options the client was built with
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// What the server reported during `initialize`
    #[must_use]
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Whether the transport still holds a live session
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Whether the handshake has completed
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    /// Send `initialize` and return the raw exchange
    pub async fn initialize_exchange(&mut self) -> Result<Exchange> {
        let params = serde_json::to_value(self.options.initialize_params())?;
        self.request(methods::INITIALIZE, Some(params)).await
    }

    /// Send `initialize`
    pub async fn initialize(&mut self) -> Result<InitializeResult> {
        self.initialize_exchange().await?.into_typed()
    }

    /// Send `notifications/initialized`
    pub async fn notify_initialized(&mut self) -> Result<()> {
        self.notify(methods::INITIALIZED, None).await
    }

    /// `initialize` followed by `notifications/initialized`
    pub async fn handshake(&mut self) -> Result<InitializeResult> {
        let result = self.initialize().await?;
        self.notify_initialized().await?;
        Ok(result)
    }

    /// Send a request and wait for its correlated response
    ///
    /// A JSON-RPC `error` is not an `Err` here; see [`Exchange::into_result`].
    pub async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Exchange> {
        if method == methods::INITIALIZE {
            if self.phase != Phase::Fresh {
                return Err(Error::Protocol("initialize was already sent".to_string()));
            }
        } else if self.phase != Phase::Ready {
            return Err(Error::Protocol(format!(
                "{method} sent before the initialize handshake completed"
            )));
        }

        let id = RequestId::Number(self.next_id);
        self.next_id += 1;
        let request = JsonRpcRequest::new(id, method, params);
        let exchange = self.exchange(request).await?;

        if method == methods::INITIALIZE {
            self.record_initialize(&exchange)?;
        }
        Ok(exchange)
    }

    /// Send a notification; no response is expected
    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let allowed = if method == methods::INITIALIZED {
            self.phase >= Phase::Initialized
        } else {
            self.phase == Phase::Ready
        };
        if !allowed {
            return Err(Error::Protocol(format!(
                "{method} sent before the initialize handshake completed"
            )));
        }

        debug!(method = %method, "Sending notification");
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        match self.transport.send(&message).await? {
            Reply::Accepted(status) => trace!(status = %status, "Notification accepted"),
            other => debug!(reply = ?other, "Unexpected reply to notification"),
        }

        if method == methods::INITIALIZED {
            self.phase = Phase::Ready;
        }
        Ok(())
    }

    /// `tools/list`, following pagination cursors
    pub async fn list_tools(&mut self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(ToolsListParams { cursor })?;
            let page: ToolsListResult = self
                .request(methods::TOOLS_LIST, Some(params))
                .await?
                .into_typed()?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(next) => {
                    warn!(cursor = %next, "Server repeated a tools/list cursor");
                    break;
                }
                None => break,
            }
        }
        Ok(tools)
    }

    /// `tools/call`, optionally opting in to progress notifications
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        progress_token: Option<ProgressToken>,
    ) -> Result<ToolCall> {
        let params = serde_json::to_value(ToolsCallParams::new(name, arguments, progress_token))?;
        let exchange = self.request(methods::TOOLS_CALL, Some(params)).await?;
        let progress = exchange.progress();
        Ok(ToolCall {
            result: exchange.into_typed()?,
            progress,
        })
    }

    /// `resources/list`, following pagination cursors
    pub async fn list_resources(&mut self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = None;
        loop {
            let params = serde_json::to_value(ResourcesListParams { cursor })?;
            let page: ResourcesListResult = self
                .request(methods::RESOURCES_LIST, Some(params))
                .await?
                .into_typed()?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if seen.insert(next.clone()) => cursor = Some(next),
                Some(_) | None => break,
            }
        }
        Ok(resources)
    }

    /// `ping`
    pub async fn ping(&mut self) -> Result<()> {
        self.request(methods::PING, None).await?.into_result()?;
        Ok(())
    }

    /// Next unsolicited message from the server
    ///
    /// Server requests are answered before being handed back. `Ok(None)`
    /// once the stream has closed.
    pub async fn next_message(&mut self) -> Result<Option<JsonRpcMessage>> {
        let message = self.transport.next_message().await?;
        if let Some(JsonRpcMessage::Request(request)) = &message {
            self.answer(request).await?;
        }
        Ok(message)
    }

    /// Close the session
    pub async fn close(&mut self) -> Result<()> {
        self.transport.close().await
    }

    fn record_initialize(&mut self, exchange: &Exchange) -> Result<()> {
        let Some(result) = &exchange.response.result else {
            return Ok(());
        };
        let init: InitializeResult = serde_json::from_value(result.clone())
            .map_err(|e| Error::Protocol(format!("Malformed initialize result: {e}")))?;

        if !is_supported_version(&init.protocol_version) {
            warn!(
                protocol_version = %init.protocol_version,
                "Server negotiated an unknown protocol version"
            );
        }
        info!(
            server = %init.server_info.name,
            version = %init.server_info.version,
            protocol_version = %init.protocol_version,
            "Server initialized"
        );
        self.server = Some(init);
        self.phase = Phase::Initialized;
        Ok(())
    }

    async fn exchange(&mut self, request: JsonRpcRequest) -> Result<Exchange> {
        let id = request.id.clone();
        debug!(id = %id, method = %request.method, "Sending request");

        let deadline = Instant::now() + self.options.request_timeout;
        let reply = self
            .transport
            .send(&JsonRpcMessage::Request(request.clone()))
            .await?;

        let mut notifications = Vec::new();
        let response = match reply {
            Reply::Message(message) => self
                .accept(message, &id, &mut notifications)
                .await?
                .ok_or_else(|| {
                    Error::Protocol(format!("Inline reply to {id} is not a response"))
                })?,
            Reply::Stream(mut stream) => loop {
                let message = timeout_at(deadline, stream.next())
                    .await
                    .map_err(|_| timed_out(&id))?
                    .ok_or_else(|| {
                        Error::Protocol(format!("Reply stream closed before response to {id}"))
                    })??;
                if let Some(response) = self.accept(message, &id, &mut notifications).await? {
                    break response;
                }
            },
            Reply::Accepted(status) => {
                trace!(id = %id, status = %status, "Request accepted, waiting on event stream");
                loop {
                    let message = timeout_at(deadline, self.transport.next_message())
                        .await
                        .map_err(|_| timed_out(&id))??
                        .ok_or_else(|| {
                            Error::Connection(format!("Event stream closed before response to {id}"))
                        })?;
                    if let Some(response) = self.accept(message, &id, &mut notifications).await? {
                        break response;
                    }
                }
            }
        };

        debug!(id = %id, is_error = response.error.is_some(), notifications = notifications.len(), "Response received");
        Ok(Exchange {
            request,
            response,
            notifications,
        })
    }

    /// Classify one inbound message while waiting for `id`
    async fn accept(
        &mut self,
        message: JsonRpcMessage,
        id: &RequestId,
        notifications: &mut Vec<JsonRpcNotification>,
    ) -> Result<Option<JsonRpcResponse>> {
        match message {
            JsonRpcMessage::Response(response) => {
                if response.id.as_ref() != Some(id) {
                    return Err(Error::Protocol(format!(
                        "Response id {} does not match request id {id}",
                        response
                            .id
                            .as_ref()
                            .map_or_else(|| "null".to_string(), ToString::to_string)
                    )));
                }
                if !response.is_terminal() {
                    return Err(Error::Protocol(format!(
                        "Response to {id} carries neither result nor error"
                    )));
                }
                Ok(Some(response))
            }
            JsonRpcMessage::Notification(notification) => {
                trace!(method = %notification.method, "Notification while waiting for {id}");
                notifications.push(notification);
                Ok(None)
            }
            JsonRpcMessage::Request(request) => {
                self.answer(&request).await?;
                Ok(None)
            }
        }
    }

    /// Answer a server-initiated request on the same session
    async fn answer(&mut self, request: &JsonRpcRequest) -> Result<()> {
        debug!(id = %request.id, method = %request.method, "Answering server request");
        let id = request.id.clone();
        let response = match request.method.as_str() {
            methods::PING => JsonRpcResponse::success(id, json!({})),
            methods::ROOTS_LIST => JsonRpcResponse::success(
                id,
                serde_json::to_value(RootsListResult {
                    roots: self.options.roots.clone(),
                })?,
            ),
            methods::ELICITATION_CREATE => JsonRpcResponse::success(
                id,
                serde_json::to_value(ElicitationCreateResult {
                    action: "decline".to_string(),
                    content: None,
                })?,
            ),
            other => JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        };

        match self.transport.send(&JsonRpcMessage::Response(response)).await? {
            Reply::Accepted(_) => {}
            other => debug!(reply = ?other, "Unexpected reply to answered server request"),
        }
        Ok(())
    }
}

fn timed_out(id: &RequestId) -> Error {
    Error::Connection(format!("Timed out waiting for response to {id}"))
}
