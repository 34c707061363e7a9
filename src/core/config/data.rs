use serde::Deserialize;
use std::collections::HashMap;

/// One configured MCP server: how to launch it and whether it participates
/// in discovery.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Unique key from the `mcpServers` document; also used in permission
    /// scopes and error messages.
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment variables injected into the child process.
    pub env: HashMap<String, String>,
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// The loaded configuration: the set of MCP servers to launch.
///
/// Immutable once loaded for a session. See [`Config::from_json_str`] for
/// the lenient loading rules.
#[derive(Debug, Default, Clone)]
pub struct Config {
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Wire shape of one `mcpServers` entry. The server name is the map key,
/// not part of the entry body.
#[derive(Debug, Deserialize)]
pub(super) struct McpServerEntry {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl McpServerEntry {
    pub(super) fn into_config(self, name: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.to_string(),
            command: self.command,
            args: self.args,
            env: self.env,
            enabled: self.enabled,
        }
    }
}
