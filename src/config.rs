//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

use crate::protocol::{PROTOCOL_VERSION, Root};
use crate::session::TransportKind;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Target server
    pub server: ServerConfig,
    /// Timeouts
    pub timeouts: TimeoutConfig,
    /// What the probe reports about itself
    pub client: ClientConfig,
    /// Scripted run
    pub scenario: ScenarioConfig,
}

/// Target server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `/sse` endpoint (legacy) or `/mcp` endpoint (Streamable HTTP)
    pub url: String,
    /// Transport override; inferred from the URL path when unset
    pub transport: Option<TransportKind>,
    /// Extra headers sent on every request (supports `${VAR}` and `${VAR:-default}`)
    pub headers: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3001/sse".to_string(),
            transport: None,
            headers: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parsed server URL
    pub fn url(&self) -> Result<Url> {
        Url::parse(&self.url).map_err(|e| Error::Config(format!("Invalid server url '{}': {e}", self.url)))
    }

    /// Configured transport, or the one implied by `url`
    #[must_use]
    pub fn transport_for(&self, url: &Url) -> TransportKind {
        self.transport.unwrap_or_else(|| TransportKind::infer(url))
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
    /// How long to wait for the legacy endpoint event
    #[serde(with = "humantime_serde")]
    pub endpoint: Duration,
    /// Bound on a single request/response exchange
    #[serde(with = "humantime_serde")]
    pub request: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            endpoint: Duration::from_secs(10),
            request: Duration::from_secs(120),
        }
    }
}

/// Client identity and capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `clientInfo.name`
    pub name: String,
    /// `clientInfo.version`
    pub version: String,
    /// Requested protocol version
    pub protocol_version: String,
    /// Roots returned when the server asks `roots/list`
    pub roots: Vec<Root>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "mcp-probe".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            roots: Vec::new(),
        }
    }
}

/// Scripted run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Tool invoked by the `tools/call` stages
    pub tool: String,
    /// Arguments passed to the tool
    pub arguments: Value,
    /// Token attached to the second `tools/call`
    pub progress_token: String,
    /// Send `ping`
    pub ping: bool,
    /// Send `resources/list`
    pub resources: bool,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            tool: "longRunningOperation".to_string(),
            arguments: json!({ "duration": 10, "steps": 5 }),
            progress_token: "op-1234".to_string(),
            ping: true,
            resources: true,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // MCP_PROBE_SERVER__URL, MCP_PROBE_TIMEOUTS__REQUEST, ...
        figment = figment.merge(Env::prefixed("MCP_PROBE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in self.server.headers.values_mut() {
            *value = Self::expand_string(&re, value);
        }
        self.server.url = Self::expand_string(&re, &self.server.url);
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Human-readable duration serde (`"30s"`, `"5m"`, `"250ms"`, bare seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        // "ms" before "s" so "250ms" is not read as "250m" + "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
