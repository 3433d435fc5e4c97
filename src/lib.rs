//! MCP Probe Library
//!
//! Session client for Model Context Protocol servers over the legacy
//! HTTP+SSE transport and the Streamable HTTP transport.
//!
//! # Features
//!
//! - **Legacy SSE**: endpoint negotiation on `/sse`, POSTs to `/message?sessionId=`
//! - **Streamable HTTP**: `Mcp-Session-Id` tracking, JSON or SSE replies per POST
//! - **Correlation**: responses matched by id, progress matched by token
//! - **Scripted runs**: the reference stage sequence with per-stage reports
//!
//! # Protocol Version
//!
//! Requests MCP 2025-06-18 and accepts servers negotiating 2025-03-26 or 2024-11-05.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scenario;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr; stdout carries the wire exchange.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?;
        }
        _ => {
            subscriber
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?;
        }
    }

    Ok(())
}
