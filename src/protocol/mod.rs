//! MCP Protocol types

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// MCP Protocol version requested during `initialize`
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions this client understands, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Check whether a server-negotiated version is one we understand
#[must_use]
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_VERSIONS.contains(&version)
}

/// JSON-RPC method names used by the driver
pub mod methods {
    /// Handshake request
    pub const INITIALIZE: &str = "initialize";
    /// Handshake completion notification
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Liveness check
    pub const PING: &str = "ping";
    /// Tool enumeration
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation
    pub const TOOLS_CALL: &str = "tools/call";
    /// Resource enumeration
    pub const RESOURCES_LIST: &str = "resources/list";
    /// Out-of-band progress for a request carrying a progress token
    pub const PROGRESS: &str = "notifications/progress";
    /// Server asks the client for its roots
    pub const ROOTS_LIST: &str = "roots/list";
    /// Server asks the client for user input
    pub const ELICITATION_CREATE: &str = "elicitation/create";
}
