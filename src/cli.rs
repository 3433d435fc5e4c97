//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

use crate::config::Config;
use crate::session::TransportKind;
use crate::{Error, Result};

/// MCP Probe - exercise an MCP server over SSE or Streamable HTTP
///
/// TARGET is a server endpoint (`http://host/sse`, `http://host/mcp`), a
/// legacy message URL carrying `sessionId`, or a bare session id.
#[derive(Parser, Debug)]
#[command(name = "mcp-probe")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Server URL, message URL or session id
    pub target: Option<String>,

    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MCP_PROBE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Transport (sse, streamable-http); inferred from the URL when omitted
    #[arg(short, long, value_parser = parse_transport)]
    pub transport: Option<TransportKind>,

    /// Tool invoked by the tools/call stages
    #[arg(long)]
    pub tool: Option<String>,

    /// Tool arguments as a JSON object
    #[arg(long)]
    pub arguments: Option<String>,

    /// Progress token for the second tools/call ("auto" generates one)
    #[arg(long)]
    pub progress_token: Option<String>,

    /// Skip the ping stage
    #[arg(long)]
    pub no_ping: bool,

    /// Skip the resources/list stage
    #[arg(long)]
    pub no_resources: bool,

    /// Keep tailing the event stream after the run until it closes or Ctrl-C
    #[arg(long)]
    pub listen: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MCP_PROBE_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MCP_PROBE_LOG_FORMAT")]
    pub log_format: Option<String>,
}

fn parse_transport(s: &str) -> std::result::Result<TransportKind, String> {
    match s {
        "sse" | "sse-legacy" => Ok(TransportKind::Sse),
        "streamable-http" | "streamable" | "http" => Ok(TransportKind::StreamableHttp),
        other => Err(format!(
            "unknown transport '{other}' (expected sse or streamable-http)"
        )),
    }
}

impl Cli {
    /// Layer command-line overrides on top of loaded configuration
    ///
    /// # Errors
    ///
    /// Returns an error if `--arguments` is not a JSON object.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(transport) = self.transport {
            config.server.transport = Some(transport);
        }
        if let Some(tool) = &self.tool {
            config.scenario.tool.clone_from(tool);
        }
        if let Some(raw) = &self.arguments {
            let arguments: serde_json::Value = serde_json::from_str(raw)
                .map_err(|e| Error::Config(format!("--arguments is not valid JSON: {e}")))?;
            if !arguments.is_object() {
                return Err(Error::Config("--arguments must be a JSON object".to_string()));
            }
            config.scenario.arguments = arguments;
        }
        if let Some(token) = &self.progress_token {
            config.scenario.progress_token.clone_from(token);
        }
        if self.no_ping {
            config.scenario.ping = false;
        }
        if self.no_resources {
            config.scenario.resources = false;
        }
        Ok(())
    }
}
