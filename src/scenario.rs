//! Scripted multi-stage run
//!
//! Walks a session through the reference sequence: handshake, tool listing,
//! a tool call without and with a progress token, then optional `ping` and
//! `resources/list`. Application errors are recorded and the run moves on;
//! connection and protocol errors end it.

use std::fmt;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::client::{ClientOptions, Exchange, McpClient};
use crate::config::ScenarioConfig;
use crate::protocol::{
    Info, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, ProgressParams, ProgressToken,
    RequestId, ToolsCallParams, methods,
};
use crate::session::{Session, TransportKind};
use crate::transport::HttpClient;
use crate::{Error, Result};

/// Progress token value that asks for a freshly generated token
pub const AUTO_PROGRESS_TOKEN: &str = "auto";

/// One step of the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// `initialize`
    Initialize,
    /// `notifications/initialized`
    Initialized,
    /// `tools/list`
    ListTools,
    /// `tools/call`, with `_meta.progressToken` when a token is set
    CallTool {
        /// Progress token to attach
        progress_token: Option<ProgressToken>,
    },
    /// `ping`
    Ping,
    /// `resources/list`
    ListResources,
}

impl Stage {
    /// JSON-RPC method
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Initialize => methods::INITIALIZE,
            Self::Initialized => methods::INITIALIZED,
            Self::ListTools => methods::TOOLS_LIST,
            Self::CallTool { .. } => methods::TOOLS_CALL,
            Self::Ping => methods::PING,
            Self::ListResources => methods::RESOURCES_LIST,
        }
    }

    /// Whether the stage sends a notification rather than a request
    #[must_use]
    pub fn is_notification(&self) -> bool {
        matches!(self, Self::Initialized)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallTool {
                progress_token: Some(token),
            } => write!(f, "{} (progressToken={token})", self.method()),
            _ => f.write_str(self.method()),
        }
    }
}

/// Outcome of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Terminal response with `result`
    Ok,
    /// Terminal response with `error`; the run continued
    ApplicationError,
    /// Posted without waiting for a correlated response
    Sent,
    /// Connection or protocol failure; the run stopped here
    Failed,
}

/// What happened in one stage
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    /// Stage label
    pub stage: String,
    /// Outcome
    pub status: StageStatus,
    /// Message as posted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    /// Correlated response, or the inline body in detached mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Notifications received before the response
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<Value>,
    /// Progress correlated by token
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub progress: Vec<ProgressParams>,
    /// HTTP status of the POST (detached mode)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Error text for failed stages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time
    pub elapsed_ms: u64,
}

impl StageReport {
    fn new(stage: &Stage, status: StageStatus, started: Instant) -> Self {
        Self {
            stage: stage.to_string(),
            status,
            request: None,
            response: None,
            notifications: Vec::new(),
            progress: Vec::new(),
            http_status: None,
            error: None,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn from_exchange(stage: &Stage, exchange: &Exchange, started: Instant) -> Result<Self> {
        let status = if exchange.is_error() {
            StageStatus::ApplicationError
        } else {
            StageStatus::Ok
        };
        let mut report = Self::new(stage, status, started);
        report.request = Some(serde_json::to_value(&exchange.request)?);
        report.response = Some(serde_json::to_value(&exchange.response)?);
        report.notifications = exchange
            .notifications
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?;
        report.progress = exchange.progress();
        report.error = exchange
            .response
            .error
            .as_ref()
            .map(|e| format!("JSON-RPC error {}: {}", e.code, e.message));
        Ok(report)
    }

    fn failed(stage: &Stage, error: &Error, started: Instant) -> Self {
        let mut report = Self::new(stage, StageStatus::Failed, started);
        report.error = Some(error.to_string());
        report
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Transport used
    pub transport: TransportKind,
    /// Session id, once known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Server identity from `initialize`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<Info>,
    /// Stage reports in order
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Stages that ended in a JSON-RPC error
    #[must_use]
    pub fn application_errors(&self) -> usize {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::ApplicationError)
            .count()
    }
}

/// The scripted sequence
#[derive(Debug, Clone)]
pub struct Scenario {
    tool: String,
    arguments: Value,
    stages: Vec<Stage>,
}

impl Scenario {
    /// Build the reference sequence from configuration
    #[must_use]
    pub fn from_config(config: &ScenarioConfig) -> Self {
        let mut stages = vec![
            Stage::Initialize,
            Stage::Initialized,
            Stage::ListTools,
            Stage::CallTool {
                progress_token: None,
            },
        ];

        let token = config.progress_token.trim();
        if token == AUTO_PROGRESS_TOKEN {
            stages.push(Stage::CallTool {
                progress_token: Some(ProgressToken::String(uuid::Uuid::new_v4().to_string())),
            });
        } else if !token.is_empty() {
            stages.push(Stage::CallTool {
                progress_token: Some(token.into()),
            });
        }

        if config.ping {
            stages.push(Stage::Ping);
        }
        if config.resources {
            stages.push(Stage::ListResources);
        }

        Self {
            tool: config.tool.clone(),
            arguments: config.arguments.clone(),
            stages,
        }
    }

    /// Stages in execution order
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn params(&self, stage: &Stage, options: &ClientOptions) -> Result<Option<Value>> {
        Ok(match stage {
            Stage::Initialize => Some(serde_json::to_value(options.initialize_params())?),
            Stage::Initialized | Stage::Ping => None,
            Stage::ListTools | Stage::ListResources => Some(json!({})),
            Stage::CallTool { progress_token } => Some(serde_json::to_value(ToolsCallParams::new(
                self.tool.clone(),
                self.arguments.clone(),
                progress_token.clone(),
            ))?),
        })
    }

    /// Run every stage against a connected client
    ///
    /// `on_stage` sees each report as soon as the stage finishes, including
    /// the failed stage of an aborted run.
    pub async fn run<F>(&self, client: &mut McpClient, mut on_stage: F) -> Result<RunReport>
    where
        F: FnMut(&StageReport),
    {
        let mut stages = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            let started = Instant::now();
            let outcome = if stage.is_notification() {
                client.notify(stage.method(), None).await.map(|()| None)
            } else {
                match self.params(stage, client.options()) {
                    Ok(params) => client.request(stage.method(), params).await.map(Some),
                    Err(e) => Err(e),
                }
            };

            let report = match outcome {
                Ok(Some(exchange)) => StageReport::from_exchange(stage, &exchange, started)?,
                Ok(None) => StageReport::new(stage, StageStatus::Sent, started),
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Stage failed, aborting run");
                    on_stage(&StageReport::failed(stage, &e, started));
                    return Err(e);
                }
            };
            on_stage(&report);

            let status = report.status;
            let error = report.error.clone();
            stages.push(report);

            if status == StageStatus::ApplicationError {
                if *stage == Stage::Initialize {
                    return Err(Error::Protocol(format!(
                        "initialize rejected: {}",
                        error.unwrap_or_default()
                    )));
                }
                warn!(stage = %stage, error = ?error, "Server returned an error, continuing");
            }
        }

        let report = RunReport {
            transport: client.transport_kind(),
            session_id: client.session().map(|s| s.id().to_string()),
            server: client.server_info().map(|s| s.server_info.clone()),
            stages,
        };
        info!(
            stages = report.stages.len(),
            application_errors = report.application_errors(),
            "Run complete"
        );
        Ok(report)
    }

    /// Post every stage to a session negotiated elsewhere
    ///
    /// Responses travel on the `/sse` stream held by whoever negotiated the
    /// session, so only the POST status and any inline body are reported.
    pub async fn dispatch_detached<F>(
        &self,
        http: &HttpClient,
        session: &Session,
        options: &ClientOptions,
        mut on_stage: F,
    ) -> Result<RunReport>
    where
        F: FnMut(&StageReport),
    {
        let url = session
            .message_endpoint()
            .ok_or_else(|| Error::Config(format!("Session {} has no message endpoint", session.id())))?;
        info!(session_id = %session.id(), url = %url, "Posting to existing session");

        let mut stages = Vec::with_capacity(self.stages.len());
        let mut next_id = 1;

        for stage in &self.stages {
            let started = Instant::now();
            let params = self.params(stage, options)?;
            let message = if stage.is_notification() {
                JsonRpcMessage::Notification(JsonRpcNotification::new(stage.method(), params))
            } else {
                let id = RequestId::Number(next_id);
                next_id += 1;
                JsonRpcMessage::Request(JsonRpcRequest::new(id, stage.method(), params))
            };

            let posted = match http.post(url, None, &message).await {
                Ok(response) => response.for_session(session.id()).error_for_status().await,
                Err(e) => Err(e),
            };
            let response = match posted {
                Ok(response) => response,
                Err(e) => {
                    warn!(stage = %stage, error = %e, "POST failed, aborting run");
                    on_stage(&StageReport::failed(stage, &e, started));
                    return Err(e);
                }
            };

            let status = response.status();
            let body = response.text().await?;
            let mut report = StageReport::new(stage, StageStatus::Sent, started);
            report.request = Some(serde_json::to_value(&message)?);
            report.http_status = Some(status.as_u16());
            if !body.trim().is_empty() {
                report.response =
                    Some(serde_json::from_str(&body).unwrap_or(Value::String(body)));
            }
            on_stage(&report);
            stages.push(report);
        }

        Ok(RunReport {
            transport: TransportKind::Sse,
            session_id: Some(session.id().to_string()),
            server: None,
            stages,
        })
    }
}
