use crate::core::config::McpServerConfig;
use crate::mcp::client::ServerConnection;
use futures_util::{stream, StreamExt};
use rust_mcp_schema::Tool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Metadata for one discovered tool: which server hosts it, the rendered
/// human-readable description used in prompts, and the raw input schema as
/// received from the server.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub server_name: String,
    pub description: String,
    pub schema: Value,
}

impl ToolDescriptor {
    fn from_tool(server_name: &str, tool: Tool) -> Self {
        let schema = serde_json::to_value(&tool.input_schema).unwrap_or(Value::Null);
        let description =
            render_tool_description(&tool.name, tool.description.as_deref(), &schema);
        Self {
            name: tool.name,
            server_name: server_name.to_string(),
            description,
            schema,
        }
    }
}

pub(crate) struct ServerEntry {
    pub(crate) config: McpServerConfig,
    pub(crate) connection: Option<Arc<ServerConnection>>,
    pub(crate) last_error: Option<String>,
}

#[derive(Default)]
pub(crate) struct Discovery {
    pub(crate) connection: Option<Arc<ServerConnection>>,
    pub(crate) last_error: Option<String>,
    pub(crate) tools: Vec<Tool>,
}

impl Discovery {
    async fn run(config: &McpServerConfig) -> Self {
        let connection = match ServerConnection::connect(config).await {
            Ok(connection) => connection,
            Err(err) => {
                warn!(server = %config.name, error = %err, "MCP server connect failed");
                return Discovery {
                    last_error: Some(err.to_string()),
                    ..Discovery::default()
                };
            }
        };
        match connection.list_tools().await {
            Ok(tools) => {
                debug!(server = %config.name, tools = tools.len(), "discovered MCP tools");
                Discovery {
                    connection: Some(connection),
                    last_error: None,
                    tools,
                }
            }
            Err(err) => {
                warn!(server = %config.name, error = %err, "MCP tool listing failed");
                connection.close().await;
                Discovery {
                    last_error: Some(err),
                    ..Discovery::default()
                }
            }
        }
    }
}

/// The set of tools discovered across every configured server, plus the live
/// connections that host them.
///
/// Built once at startup and read-shared across conversations afterwards.
pub struct ToolRegistry {
    servers: HashMap<String, ServerEntry>,
    tools: HashMap<String, ToolDescriptor>,
    tool_order: Vec<String>,
}

impl ToolRegistry {
    /// Connects every enabled server concurrently, runs the handshake and
    /// tool listing for each, and indexes whatever succeeded. Per-server
    /// failures are logged and isolated; the build itself never fails, so a
    /// fully broken configuration still yields a usable (empty) registry.
    pub async fn build(configs: Vec<McpServerConfig>) -> Self {
        let enabled: Vec<McpServerConfig> = configs
            .iter()
            .filter(|config| config.is_enabled())
            .cloned()
            .collect();
        let width = enabled.len().max(1);

        let discovered: HashMap<String, Discovery> = stream::iter(enabled)
            .map(|config| async move {
                let discovery = Discovery::run(&config).await;
                (config.name.clone(), discovery)
            })
            .buffer_unordered(width)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect();

        Self::assemble(configs, discovered)
    }

    /// Discovery results are applied in configuration order: when two
    /// servers expose the same tool name, the last configured server wins,
    /// independent of connect timing. A deliberate simplification, not a
    /// detected error.
    pub(crate) fn assemble(
        configs: Vec<McpServerConfig>,
        mut discovered: HashMap<String, Discovery>,
    ) -> Self {
        let mut registry = Self {
            servers: HashMap::new(),
            tools: HashMap::new(),
            tool_order: Vec::new(),
        };
        for config in configs {
            let discovery = discovered.remove(&config.name).unwrap_or_default();
            for tool in discovery.tools {
                registry.insert_tool(ToolDescriptor::from_tool(&config.name, tool));
            }
            registry.servers.insert(
                config.name.clone(),
                ServerEntry {
                    config,
                    connection: discovery.connection,
                    last_error: discovery.last_error,
                },
            );
        }
        registry
    }

    fn insert_tool(&mut self, descriptor: ToolDescriptor) {
        let name = descriptor.name.clone();
        if self.tools.insert(name.clone(), descriptor).is_some() {
            debug!(tool = %name, "tool name collision, last registration wins");
            self.tool_order.retain(|existing| existing != &name);
        }
        self.tool_order.push(name);
    }

    pub fn lookup(&self, tool_name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(tool_name)
    }

    /// Renders every tool's description, newline-joined in registration
    /// order, for splicing into the system prompt. An empty registry yields
    /// an empty string so callers can omit the tools section entirely.
    pub fn describe_all(&self) -> String {
        self.tool_order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|descriptor| descriptor.description.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn connection_for(&self, server_name: &str) -> Option<Arc<ServerConnection>> {
        self.servers
            .get(server_name)
            .and_then(|entry| entry.connection.clone())
    }

    /// The most recent connect or discovery error for a server, kept for
    /// error messages after the connection is gone.
    pub fn last_error(&self, server_name: &str) -> Option<&str> {
        self.servers
            .get(server_name)
            .and_then(|entry| entry.last_error.as_deref())
    }

    /// Closes every live connection, each under a bounded grace period, so
    /// one hung server cannot block releasing the others. Best-effort:
    /// individual close failures are logged and swallowed.
    pub async fn shutdown(&self) {
        let closes = self
            .servers
            .values()
            .filter_map(|entry| {
                let connection = entry.connection.clone()?;
                Some((entry.config.name.clone(), connection))
            })
            .map(|(name, connection)| async move {
                if tokio::time::timeout(SHUTDOWN_GRACE, connection.close())
                    .await
                    .is_err()
                {
                    warn!(server = %name, "timed out closing MCP connection");
                }
            });
        futures_util::future::join_all(closes).await;
    }
}

fn render_tool_description(name: &str, description: Option<&str>, schema: &Value) -> String {
    let mut lines = vec![
        format!("Tool: {name}"),
        format!("Description: {}", description.unwrap_or("No description")),
        "Arguments:".to_string(),
    ];
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (argument, meta) in properties {
            let description = meta
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("No description");
            let suffix = if required.contains(&argument.as_str()) {
                " (required)"
            } else {
                ""
            };
            lines.push(format!("- {argument}: {description}{suffix}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{
        mock_server_config, registry_over_mocks, tool_json, MockToolServer,
    };
    use serde_json::json;

    #[tokio::test]
    async fn build_returns_registry_even_when_every_server_fails() {
        let configs = vec![
            mock_server_config("alpha", "/definitely-missing-command"),
            mock_server_config("beta", "/definitely-missing-command-2"),
        ];
        let registry = ToolRegistry::build(configs).await;

        assert!(registry.describe_all().is_empty());
        assert!(registry.last_error("alpha").is_some());
        assert!(registry.last_error("beta").is_some());
        assert!(registry.connection_for("alpha").is_none());
    }

    #[tokio::test]
    async fn disabled_servers_are_skipped_during_build() {
        let mut config = mock_server_config("off", "/definitely-missing-command");
        config.enabled = Some(false);
        let registry = ToolRegistry::build(vec![config]).await;

        // Never launched, so no error either.
        assert!(registry.last_error("off").is_none());
        assert!(registry.connection_for("off").is_none());
    }

    #[tokio::test]
    async fn failed_server_does_not_hide_tools_from_healthy_ones() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        MockToolServer::new(vec![tool_json("search", "finds things")]).spawn(server_io);
        let connection = crate::mcp::client::ServerConnection::connect_for_test("healthy", client_io)
            .await
            .expect("handshake should succeed");
        let tools = connection.list_tools().await.expect("listing should succeed");

        let mut discovered = HashMap::new();
        discovered.insert(
            "healthy".to_string(),
            Discovery {
                connection: Some(connection),
                last_error: None,
                tools,
            },
        );
        discovered.insert(
            "broken".to_string(),
            Discovery {
                last_error: Some("spawn failed".to_string()),
                ..Discovery::default()
            },
        );

        let registry = ToolRegistry::assemble(
            vec![
                mock_server_config("healthy", "mcp-healthy"),
                mock_server_config("broken", "mcp-broken"),
            ],
            discovered,
        );

        assert!(registry.lookup("search").is_some());
        assert_eq!(registry.last_error("broken"), Some("spawn failed"));
        assert!(registry.connection_for("broken").is_none());
    }

    #[tokio::test]
    async fn collisions_resolve_to_the_last_configured_server() {
        let (registry, _handles) = registry_over_mocks(vec![
            ("first", MockToolServer::new(vec![tool_json("dup", "v1")])),
            ("second", MockToolServer::new(vec![tool_json("dup", "v2")])),
        ])
        .await;

        let descriptor = registry.lookup("dup").expect("tool should be present");
        assert_eq!(descriptor.server_name, "second");
        assert!(descriptor.description.contains("v2"));
    }

    #[tokio::test]
    async fn describe_all_renders_arguments_with_required_flags() {
        let tool = json!({
            "name": "search",
            "description": "Full-text search",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "q": {"type": "string", "description": "query text"},
                    "limit": {"type": "number", "description": "max results"}
                },
                "required": ["q"]
            }
        });
        let (registry, _handles) =
            registry_over_mocks(vec![("alpha", MockToolServer::new(vec![tool]))]).await;

        let rendered = registry.describe_all();
        assert!(rendered.contains("Tool: search"));
        assert!(rendered.contains("Description: Full-text search"));
        assert!(rendered.contains("- q: query text (required)"));
        assert!(rendered.contains("- limit: max results"));
        assert!(!rendered.contains("limit: max results (required)"));
    }

    #[tokio::test]
    async fn describe_all_is_empty_for_an_empty_registry() {
        let registry = ToolRegistry::build(Vec::new()).await;
        assert_eq!(registry.describe_all(), "");
    }

    #[tokio::test]
    async fn connection_for_resolves_only_live_servers() {
        let (registry, _handles) = registry_over_mocks(vec![(
            "alpha",
            MockToolServer::new(vec![tool_json("search", "finds things")]),
        )])
        .await;

        assert!(registry.connection_for("alpha").is_some());
        assert!(registry.connection_for("unknown").is_none());
    }

    #[tokio::test]
    async fn shutdown_with_one_hung_call_still_releases_the_rest() {
        let (registry, _handles) = registry_over_mocks(vec![
            (
                "stuck",
                MockToolServer::new(vec![tool_json("hang", "hangs")])
                    .with_delay(std::time::Duration::from_secs(30)),
            ),
            ("fine", MockToolServer::new(vec![tool_json("ping", "pings")])),
        ])
        .await;
        let registry = Arc::new(registry);

        let call = tokio::spawn({
            let registry = registry.clone();
            async move {
                let connection = registry
                    .connection_for("stuck")
                    .expect("connection should exist");
                connection.call_tool("hang", serde_json::Map::new()).await
            }
        });
        // Let the call get in flight before shutting down.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        tokio::time::timeout(std::time::Duration::from_secs(2), registry.shutdown())
            .await
            .expect("shutdown should stay bounded");

        let fine = registry
            .connection_for("fine")
            .expect("connection should exist");
        assert_eq!(fine.state(), crate::mcp::client::SessionState::Closed);

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), call)
            .await
            .expect("the hung call should be released promptly")
            .expect("task should join");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn shutdown_closes_all_live_connections() {
        let (registry, _handles) = registry_over_mocks(vec![
            (
                "alpha",
                MockToolServer::new(vec![tool_json("search", "finds things")]),
            ),
            (
                "beta",
                MockToolServer::new(vec![tool_json("fetch", "fetches things")]),
            ),
        ])
        .await;

        registry.shutdown().await;

        for name in ["alpha", "beta"] {
            let connection = registry
                .connection_for(name)
                .expect("connection should still be present");
            assert_eq!(
                connection.state(),
                crate::mcp::client::SessionState::Closed
            );
        }
    }
}
