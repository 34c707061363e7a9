use super::data::{Config, McpServerEntry};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Errors that can occur when loading configuration.
///
/// The lenient loaders ([`Config::from_json_str`],
/// [`Config::load_from_path`]) log these and degrade to an empty server
/// set; [`Config::try_from_json_str`] surfaces them to callers that want
/// the cause.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    Read {
        /// Path to the configuration file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the configuration document as JSON.
    Parse {
        /// The JSON deserialization error.
        source: serde_json::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read config at {}: {}", path.display(), source)
            }
            ConfigError::Parse { source } => {
                write!(f, "Failed to parse config: {}", source)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source } => Some(source),
        }
    }
}

/// Top-level shape of the configuration document:
/// `{"mcpServers": {<name>: {"command": ..., "args": [...]}}}`.
///
/// Entries are keyed by server name; a `BTreeMap` keeps iteration order
/// deterministic, which matters because tool-name collisions across servers
/// resolve to the last server processed.
#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, serde_json::Value>,
}

impl Config {
    /// Strict parse of the configuration document, surfacing the cause.
    pub fn try_from_json_str(text: &str) -> Result<Config, ConfigError> {
        let document: ConfigDocument =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse { source })?;

        let mut mcp_servers = Vec::with_capacity(document.mcp_servers.len());
        for (name, value) in document.mcp_servers {
            if name.trim().is_empty() {
                warn!("ignoring MCP server entry with a blank name");
                continue;
            }
            let entry = match serde_json::from_value::<McpServerEntry>(value) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(server = %name, error = %err, "ignoring malformed MCP server entry");
                    continue;
                }
            };
            if entry.command.trim().is_empty() {
                warn!(server = %name, "ignoring MCP server entry with a blank command");
                continue;
            }
            mcp_servers.push(entry.into_config(&name));
        }

        Ok(Config { mcp_servers })
    }

    /// Lenient parse: malformed configuration yields an empty server set
    /// rather than an error, so a broken document never prevents startup.
    pub fn from_json_str(text: &str) -> Config {
        match Self::try_from_json_str(text) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "ignoring malformed MCP configuration");
                Config::default()
            }
        }
    }

    /// Loads the configuration document from a file. A missing or unreadable
    /// file behaves like malformed content: empty server set, logged.
    pub fn load_from_path(path: &Path) -> Config {
        if !path.exists() {
            debug!(path = %path.display(), "no MCP configuration file");
            return Config::default();
        }
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_json_str(&contents),
            Err(source) => {
                let err = ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                };
                warn!(error = %err, "ignoring unreadable MCP configuration");
                Config::default()
            }
        }
    }
}
