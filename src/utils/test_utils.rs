//! Shared test fixtures: a scripted MCP server speaking line-delimited
//! JSON-RPC over an in-process pipe, plus registry and config builders.

use crate::core::config::McpServerConfig;
use crate::mcp::client::ServerConnection;
use crate::mcp::registry::{Discovery, ToolRegistry};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Opt-in tracing for test debugging: honors `RUST_LOG` when set.
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn mock_server_config(name: &str, command: &str) -> McpServerConfig {
    McpServerConfig {
        name: name.to_string(),
        command: command.to_string(),
        args: Vec::new(),
        env: HashMap::new(),
        enabled: None,
    }
}

/// A tool definition in wire form, with a single required `q` argument.
pub fn tool_json(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {
            "type": "object",
            "properties": {"q": {"type": "string", "description": "query text"}},
            "required": ["q"]
        }
    })
}

/// Scripted MCP server: answers initialize, pages `tools/list`, and replies
/// to `tools/call` from canned results, optionally after a delay.
pub struct MockToolServer {
    tools: Vec<Value>,
    call_results: HashMap<String, Value>,
    call_errors: HashMap<String, (i64, String)>,
    call_delay: Duration,
    page_size: usize,
}

/// Observer for a spawned mock: the methods and tool calls it has seen
/// (`recv:<tool>` / `sent:<tool>` around each call), plus a kill switch.
pub struct MockServerHandle {
    events: Arc<Mutex<Vec<String>>>,
    stop: CancellationToken,
}

impl MockServerHandle {
    pub async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }

    /// Drops the mock's end of the pipe, as a crashing server would.
    pub async fn hang_up(&self) {
        self.stop.cancel();
    }
}

impl MockToolServer {
    pub fn new(tools: Vec<Value>) -> Self {
        Self {
            tools,
            call_results: HashMap::new(),
            call_errors: HashMap::new(),
            call_delay: Duration::ZERO,
            page_size: 0,
        }
    }

    /// Canned `tools/call` result body, e.g. `{"content": [...]}`.
    pub fn with_result(mut self, tool: &str, result: Value) -> Self {
        self.call_results.insert(tool.to_string(), result);
        self
    }

    /// Answer `tools/call` for this tool with a JSON-RPC error frame.
    pub fn with_rpc_error(mut self, tool: &str, code: i64, message: &str) -> Self {
        self.call_errors
            .insert(tool.to_string(), (code, message.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Page `tools/list` responses with `page_size` tools per cursor.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn spawn(self, stream: DuplexStream) -> MockServerHandle {
        let events = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();
        let handle = MockServerHandle {
            events: events.clone(),
            stop: stop.clone(),
        };
        tokio::spawn(run(self, stream, events, stop));
        handle
    }
}

async fn run(
    server: MockToolServer,
    stream: DuplexStream,
    events: Arc<Mutex<Vec<String>>>,
    stop: CancellationToken,
) {
    let (reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        events.lock().await.push(method.clone());

        match method.as_str() {
            "initialize" => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2025-11-25",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock", "version": "0.1.0", "icons": []}
                    }
                });
                write_line(&writer, &response).await;
            }
            "notifications/initialized" => {}
            "tools/list" => {
                let cursor = request.pointer("/params/cursor").and_then(Value::as_str);
                let response = tools_page(&server, cursor, id);
                write_line(&writer, &response).await;
            }
            "tools/call" => {
                let name = request
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                events.lock().await.push(format!("recv:{name}"));
                let response = call_response(&server, &name, id);
                let delay = server.call_delay;
                let writer = writer.clone();
                let events = events.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = stop.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    events.lock().await.push(format!("sent:{name}"));
                    write_line(&writer, &response).await;
                });
            }
            _ => {
                if !id.is_null() {
                    let response = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": "Method not found"}
                    });
                    write_line(&writer, &response).await;
                }
            }
        }
    }
}

fn tools_page(server: &MockToolServer, cursor: Option<&str>, id: Value) -> Value {
    if server.page_size == 0 {
        return json!({"jsonrpc": "2.0", "id": id, "result": {"tools": server.tools}});
    }
    let page_index = cursor
        .and_then(|cursor| cursor.strip_prefix("page-"))
        .and_then(|index| index.parse::<usize>().ok())
        .unwrap_or(0);
    let start = page_index * server.page_size;
    let end = (start + server.page_size).min(server.tools.len());
    let page = server.tools.get(start..end).unwrap_or_default();
    let mut result = json!({"tools": page});
    if end < server.tools.len() {
        result["nextCursor"] = json!(format!("page-{}", page_index + 1));
    }
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn call_response(server: &MockToolServer, name: &str, id: Value) -> Value {
    if let Some((code, message)) = server.call_errors.get(name) {
        return json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message}
        });
    }
    let result = server.call_results.get(name).cloned().unwrap_or_else(|| {
        json!({"content": [{"type": "text", "text": format!("{name} ok")}]})
    });
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

async fn write_line(writer: &Arc<Mutex<WriteHalf<DuplexStream>>>, value: &Value) {
    let mut writer = writer.lock().await;
    let payload = format!("{value}\n");
    let _ = writer.write_all(payload.as_bytes()).await;
    let _ = writer.flush().await;
}

/// Builds a registry whose servers are mocks connected over in-process
/// pipes, taking the same assembly path as a live build.
pub async fn registry_over_mocks(
    servers: Vec<(&str, MockToolServer)>,
) -> (ToolRegistry, Vec<MockServerHandle>) {
    let mut configs = Vec::new();
    let mut discovered = HashMap::new();
    let mut handles = Vec::new();
    for (name, mock) in servers {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        handles.push(mock.spawn(server_io));
        let connection = ServerConnection::connect_for_test(name, client_io)
            .await
            .expect("mock handshake should succeed");
        let tools = connection
            .list_tools()
            .await
            .expect("mock listing should succeed");
        discovered.insert(
            name.to_string(),
            Discovery {
                connection: Some(connection),
                last_error: None,
                tools,
            },
        );
        configs.push(mock_server_config(name, "mcp-mock"));
    }
    (ToolRegistry::assemble(configs, discovered), handles)
}
