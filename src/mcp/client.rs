use crate::core::config::McpServerConfig;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, CallToolResult, ClientCapabilities, Implementation,
    InitializeRequestParams, InitializeResult, ListToolsResult, PaginatedRequestParams, RequestId,
    RpcError, Tool, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOOL_LIST: usize = 100;

/// Lifecycle of one MCP session. `Failed` is terminal: a failed connection
/// never reconnects, and its tools can no longer be called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Closed,
    Failed,
}

const STATE_CONNECTING: u8 = 0;
const STATE_READY: u8 = 1;
const STATE_CLOSED: u8 = 2;
const STATE_FAILED: u8 = 3;

fn decode_state(raw: u8) -> SessionState {
    match raw {
        STATE_READY => SessionState::Ready,
        STATE_CLOSED => SessionState::Closed,
        STATE_FAILED => SessionState::Failed,
        _ => SessionState::Connecting,
    }
}

/// Ready is only reachable from Connecting; Closed and Failed only from a
/// live session. Returns whether the transition applied.
fn transition(state: &AtomicU8, next: u8) -> bool {
    let mut current = state.load(Ordering::SeqCst);
    loop {
        let allowed = match next {
            STATE_READY => current == STATE_CONNECTING,
            STATE_CLOSED | STATE_FAILED => {
                current == STATE_CONNECTING || current == STATE_READY
            }
            _ => false,
        };
        if !allowed {
            return false;
        }
        match state.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

/// Errors raised while launching a server process and establishing its MCP
/// session. Discovery isolates these per server; they never abort startup as
/// a whole.
#[derive(Debug)]
pub enum ConnectError {
    /// The configured command could not be spawned.
    Spawn {
        server: String,
        source: std::io::Error,
    },

    /// The child process launched but its stdio streams could not be wired.
    Transport { server: String, reason: String },

    /// The MCP initialize handshake failed or timed out.
    Handshake { server: String, reason: String },
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Spawn { server, source } => {
                write!(f, "Failed to launch MCP server {}: {}", server, source)
            }
            ConnectError::Transport { server, reason } => {
                write!(f, "Failed to wire MCP server {}: {}", server, reason)
            }
            ConnectError::Handshake { server, reason } => {
                write!(f, "MCP handshake with {} failed: {}", server, reason)
            }
        }
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConnectError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// One MCP server subprocess and its session.
///
/// Requests are written as line-delimited JSON-RPC to the child's stdin; a
/// background reader task matches response frames to waiters by request id.
/// The child is killed and reaped on [`ServerConnection::close`], and on
/// every failure path after a successful spawn.
pub struct ServerConnection {
    server_name: String,
    writer: SharedWriter,
    pending: PendingMap,
    next_request_id: AtomicI64,
    state: Arc<AtomicU8>,
    server_details: RwLock<Option<InitializeResult>>,
    call_guard: Mutex<()>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server_name", &self.server_name)
            .field("state", &self.state.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Launches the configured command, wires its stdio as the transport,
    /// and runs the MCP initialize handshake. Any failure after the spawn
    /// terminates the child before returning.
    pub async fn connect(config: &McpServerConfig) -> Result<Arc<Self>, ConnectError> {
        debug!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            "starting MCP server process"
        );
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ConnectError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = match child.stdin.take() {
            Some(stdin) => stdin,
            None => return Err(Self::abort_spawn(child, config, "Unable to retrieve stdin.").await),
        };
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                return Err(Self::abort_spawn(child, config, "Unable to retrieve stdout.").await)
            }
        };
        let stderr = match child.stderr.take() {
            Some(stderr) => stderr,
            None => {
                return Err(Self::abort_spawn(child, config, "Unable to retrieve stderr.").await)
            }
        };

        let connection = Self::wire(config.name.clone(), stdout, stdin);
        Self::spawn_stderr_drain(stderr);
        Self::spawn_reaper(
            child,
            connection.pending.clone(),
            connection.state.clone(),
            connection.shutdown.clone(),
            config.name.clone(),
        );

        if let Err(reason) = connection.handshake().await {
            connection.abort();
            return Err(ConnectError::Handshake {
                server: config.name.clone(),
                reason,
            });
        }
        Ok(connection)
    }

    async fn abort_spawn(mut child: Child, config: &McpServerConfig, reason: &str) -> ConnectError {
        let _ = child.start_kill();
        let _ = child.wait().await;
        ConnectError::Transport {
            server: config.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Wires a connection over arbitrary byte streams and starts the reader
    /// task. `connect` uses the child's stdio; tests use in-process pipes.
    fn wire<R, W>(server_name: String, reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let state = Arc::new(AtomicU8::new(STATE_CONNECTING));
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let shutdown = CancellationToken::new();

        Self::spawn_reader(
            reader,
            pending.clone(),
            writer.clone(),
            state.clone(),
            shutdown.clone(),
            server_name.clone(),
        );

        Arc::new(Self {
            server_name,
            writer,
            pending,
            next_request_id: AtomicI64::new(0),
            state,
            server_details: RwLock::new(None),
            call_guard: Mutex::new(()),
            shutdown,
        })
    }

    fn spawn_reader<R>(
        reader: R,
        pending: PendingMap,
        writer: SharedWriter,
        state: Arc<AtomicU8>,
        shutdown: CancellationToken,
        server_name: String,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => break,
                    },
                };
                let value = match serde_json::from_str::<Value>(&line) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Ok(message) = serde_json::from_value::<ServerMessage>(item.clone()) {
                            Self::dispatch_message(&pending, message, &server_name, &writer).await;
                        }
                    }
                } else if let Ok(message) = serde_json::from_value::<ServerMessage>(value) {
                    Self::dispatch_message(&pending, message, &server_name, &writer).await;
                }
            }
            // EOF or shutdown: wake every waiter with a closed channel. A
            // clean close has already moved the state on, so the Failed
            // transition only applies to live sessions.
            pending.lock().await.clear();
            if transition(&state, STATE_FAILED) {
                warn!(server = %server_name, "MCP transport ended unexpectedly");
            }
        });
    }

    fn spawn_stderr_drain(stderr: tokio::process::ChildStderr) {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(_)) = reader.next_line().await {}
        });
    }

    fn spawn_reaper(
        mut child: Child,
        pending: PendingMap,
        state: Arc<AtomicU8>,
        shutdown: CancellationToken,
        server_name: String,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(server = %server_name, status = ?status.ok(), "MCP server process exited");
                    transition(&state, STATE_FAILED);
                }
                _ = shutdown.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    debug!(server = %server_name, "MCP server process terminated");
                }
            }
            pending.lock().await.clear();
        });
    }

    async fn dispatch_message(
        pending: &PendingMap,
        message: ServerMessage,
        server_name: &str,
        writer: &SharedWriter,
    ) {
        match &message {
            ServerMessage::Response(response) => {
                if let Some(tx) = pending.lock().await.remove(&response.id) {
                    let _ = tx.send(message);
                }
            }
            ServerMessage::Error(error) => {
                debug!(
                    server = %server_name,
                    error_code = error.error.code,
                    "received MCP error frame"
                );
                if let Some(id) = error.id.as_ref() {
                    if let Some(tx) = pending.lock().await.remove(id) {
                        let _ = tx.send(message);
                    }
                }
            }
            ServerMessage::Request(request) => {
                // Server-initiated requests (sampling and friends) are not
                // part of this client's protocol subset.
                debug!(
                    server = %server_name,
                    method = %request.method(),
                    "rejecting unsupported server request"
                );
                let reply = ClientMessage::from_message(
                    MessageFromClient::Error(
                        RpcError::method_not_found()
                            .with_message("Unsupported MCP request from server."),
                    ),
                    Some(request.request_id().clone()),
                );
                if let Ok(reply) = reply {
                    let _ = write_message(writer, &reply).await;
                }
            }
            ServerMessage::Notification(_) => {
                debug!(server = %server_name, "ignoring MCP server notification");
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.server_name
    }

    pub fn state(&self) -> SessionState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    fn mark_ready(&self) {
        transition(&self.state, STATE_READY);
    }

    fn mark_failed(&self) {
        transition(&self.state, STATE_FAILED);
    }

    /// Failure teardown: mark the session failed and terminate the child.
    fn abort(&self) {
        self.mark_failed();
        self.shutdown.cancel();
    }

    async fn handshake(&self) -> Result<(), String> {
        let initialize = self.initialize();
        let details = match tokio::time::timeout(CONNECT_TIMEOUT, initialize).await {
            Ok(result) => result?,
            Err(_) => return Err("MCP handshake timed out.".to_string()),
        };
        debug!(
            server = %self.server_name,
            remote = %details.server_info.name,
            version = %details.server_info.version,
            protocol = %details.protocol_version,
            "MCP handshake complete"
        );
        self.mark_ready();
        Ok(())
    }

    async fn initialize(&self) -> Result<InitializeResult, String> {
        let response = self
            .send_request(RequestFromClient::InitializeRequest(client_details()))
            .await?;
        let result = parse_initialize_result(response)?;
        *self.server_details.write().await = Some(result.clone());
        self.send_notification(NotificationFromClient::InitializedNotification(None))
            .await?;
        Ok(result)
    }

    async fn supports_tools(&self) -> bool {
        self.server_details
            .read()
            .await
            .as_ref()
            .map(|details| details.capabilities.tools.is_some())
            // Servers that reported no capabilities get the benefit of the doubt.
            .unwrap_or(true)
    }

    /// Lists the server's tools, following pagination cursors up to a hard
    /// cap so a misbehaving server cannot balloon discovery.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, String> {
        if !self.supports_tools().await {
            debug!(server = %self.server_name, "server does not advertise tool support");
            return Ok(Vec::new());
        }

        let mut list = self.fetch_tools_page(None).await?;
        let mut tools = std::mem::take(&mut list.tools);
        let mut next_cursor = list.next_cursor.take();
        while tools.len() < MAX_TOOL_LIST {
            let Some(cursor) = next_cursor.take() else {
                break;
            };
            let mut page = self.fetch_tools_page(Some(cursor)).await?;
            tools.append(&mut page.tools);
            next_cursor = page.next_cursor.take();
        }
        tools.truncate(MAX_TOOL_LIST);
        Ok(tools)
    }

    async fn fetch_tools_page(&self, cursor: Option<String>) -> Result<ListToolsResult, String> {
        let params = cursor.map(|cursor| PaginatedRequestParams {
            cursor: Some(cursor),
            meta: None,
        });
        let response = self
            .send_request(RequestFromClient::ListToolsRequest(params))
            .await?;
        parse_response(response)
    }

    /// Executes one tool call and awaits its response frame.
    ///
    /// Calls on a single connection are serialized by an internal guard:
    /// responses are matched by request id, so pipelining would be safe, but
    /// one in-flight call per connection keeps the stdio frame interleaving
    /// trivially deterministic. Calls on different connections run freely
    /// concurrently.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> Result<CallToolResult, String> {
        match self.state() {
            SessionState::Ready => {}
            state => {
                return Err(format!(
                    "MCP server {} is not ready ({:?}).",
                    self.server_name, state
                ))
            }
        }
        let _guard = self.call_guard.lock().await;
        let mut params = CallToolRequestParams::new(name);
        if !arguments.is_empty() {
            params = params.with_arguments(arguments);
        }
        let response = self
            .send_request(RequestFromClient::CallToolRequest(params))
            .await?;
        parse_response(response)
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, String> {
        let request_id = self.next_request_id();
        debug!(server = %self.server_name, request_id = ?request_id, "sending MCP request");
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| err.to_string())?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        if let Err(err) = write_message(&self.writer, &message).await {
            self.pending.lock().await.remove(&request_id);
            self.mark_failed();
            return Err(err);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => {
                self.mark_failed();
                Err("MCP response channel closed before a reply arrived.".to_string())
            }
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                self.mark_failed();
                Err("MCP request timed out.".to_string())
            }
        }
    }

    async fn send_notification(&self, notification: NotificationFromClient) -> Result<(), String> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| err.to_string())?;
        write_message(&self.writer, &message).await
    }

    /// Terminates the child process and releases transport resources.
    /// Idempotent; a Failed session stays Failed.
    pub async fn close(&self) {
        transition(&self.state, STATE_CLOSED);
        self.shutdown.cancel();
        // Closing stdin lets a well-behaved server exit before the reaper
        // resorts to killing it.
        if let Ok(mut writer) = tokio::time::timeout(LOCK_TIMEOUT, self.writer.lock()).await {
            let _ = writer.shutdown().await;
        }
        debug!(server = %self.server_name, "MCP connection closed");
    }

    #[cfg(test)]
    pub(crate) async fn connect_for_test(
        name: &str,
        stream: tokio::io::DuplexStream,
    ) -> Result<Arc<Self>, String> {
        let (reader, writer) = tokio::io::split(stream);
        let connection = Self::wire(name.to_string(), reader, writer);
        if let Err(reason) = connection.handshake().await {
            connection.abort();
            return Err(reason);
        }
        Ok(connection)
    }
}

async fn write_message(writer: &SharedWriter, message: &ClientMessage) -> Result<(), String> {
    let payload = serde_json::to_string(message).map_err(|err| err.to_string())?;
    let mut writer = match tokio::time::timeout(LOCK_TIMEOUT, writer.lock()).await {
        Ok(writer) => writer,
        Err(_) => return Err("Timed out waiting for the MCP transport write lock.".to_string()),
    };
    tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(payload.as_bytes()))
        .await
        .map_err(|_| "Timed out writing MCP message.".to_string())?
        .map_err(|err| err.to_string())?;
    tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(b"\n"))
        .await
        .map_err(|_| "Timed out writing MCP message delimiter.".to_string())?
        .map_err(|err| err.to_string())?;
    tokio::time::timeout(WRITE_TIMEOUT, writer.flush())
        .await
        .map_err(|_| "Timed out flushing MCP message.".to_string())?
        .map_err(|err| err.to_string())?;
    Ok(())
}

fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "toolbridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Toolbridge MCP Client".to_string()),
            description: None,
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let value = parse_response_value(message)?;
    let result =
        serde_json::from_value::<InitializeResult>(value).map_err(|err| err.to_string())?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

fn parse_response<T: serde::de::DeserializeOwned>(message: ServerMessage) -> Result<T, String> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| err.to_string())
}

fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format!("Unexpected MCP server message: {other:?}")),
    }
}

fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_utils::{tool_json, MockToolServer};
    use serde_json::json;

    #[tokio::test]
    async fn handshake_reaches_ready_and_sends_initialized_notification() {
        crate::utils::test_utils::init_test_tracing();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let handle = MockToolServer::new(vec![]).spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");
        assert_eq!(connection.state(), SessionState::Ready);

        // The notification is fire-and-forget; give the mock a moment to
        // read it off the pipe.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let events = handle.events().await;
            if events.len() >= 2 {
                assert_eq!(events[0], "initialize");
                assert_eq!(events[1], "notifications/initialized");
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mock never saw the initialized notification: {events:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn list_tools_follows_pagination_cursors() {
        let tools: Vec<_> = (0..5)
            .map(|idx| tool_json(&format!("tool-{idx}"), "does a thing"))
            .collect();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        MockToolServer::new(tools).with_page_size(2).spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");
        let listed = connection.list_tools().await.expect("listing should succeed");

        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0].name, "tool-0");
        assert_eq!(listed[4].name, "tool-4");
    }

    #[tokio::test]
    async fn list_tools_caps_runaway_pagination() {
        let tools: Vec<_> = (0..MAX_TOOL_LIST + 20)
            .map(|idx| tool_json(&format!("tool-{idx}"), "does a thing"))
            .collect();
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        MockToolServer::new(tools).with_page_size(40).spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");
        let listed = connection.list_tools().await.expect("listing should succeed");

        assert_eq!(listed.len(), MAX_TOOL_LIST);
    }

    #[tokio::test]
    async fn call_tool_returns_result_content() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        MockToolServer::new(vec![tool_json("search", "searches")])
            .with_result(
                "search",
                json!({"content": [{"type": "text", "text": "three hits"}]}),
            )
            .spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");
        let result = connection
            .call_tool("search", serde_json::Map::new())
            .await
            .expect("call should succeed");

        assert_eq!(result.is_error, None);
        assert_eq!(result.content.len(), 1);
    }

    #[tokio::test]
    async fn call_tool_surfaces_rpc_error_frames() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        MockToolServer::new(vec![tool_json("search", "searches")])
            .with_rpc_error("search", -32602, "bad arguments")
            .spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");
        let err = connection
            .call_tool("search", serde_json::Map::new())
            .await
            .expect_err("call should fail");

        assert!(err.contains("MCP error -32602"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn calls_on_one_connection_are_serialized() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let handle = MockToolServer::new(vec![
            tool_json("slow", "slow tool"),
            tool_json("fast", "fast tool"),
        ])
        .with_delay(Duration::from_millis(50))
        .spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");

        let slow = connection.call_tool("slow", serde_json::Map::new());
        let fast = connection.call_tool("fast", serde_json::Map::new());
        let (slow, fast) = tokio::join!(slow, fast);
        slow.expect("slow call should succeed");
        fast.expect("fast call should succeed");

        let events = handle.events().await;
        let order: Vec<_> = events
            .iter()
            .filter(|event| event.starts_with("recv:") || event.starts_with("sent:"))
            .cloned()
            .collect();
        // The second call's request frame must not hit the server until the
        // first call's response has been sent.
        assert_eq!(order.len(), 4);
        assert!(order[0].starts_with("recv:"));
        assert_eq!(order[1], order[0].replace("recv:", "sent:"));
        assert!(order[2].starts_with("recv:"));
        assert_eq!(order[3], order[2].replace("recv:", "sent:"));
    }

    #[tokio::test]
    async fn peer_eof_fails_the_session_and_wakes_waiters() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let handle = MockToolServer::new(vec![tool_json("search", "searches")])
            .with_delay(Duration::from_secs(30))
            .spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");

        let call = tokio::spawn({
            let connection = connection.clone();
            async move { connection.call_tool("search", serde_json::Map::new()).await }
        });
        // Let the request frame reach the mock, then hang up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.hang_up().await;

        let result = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("waiter should wake promptly")
            .expect("task should join");
        assert!(result.is_err());
        assert_eq!(connection.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_further_calls() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        MockToolServer::new(vec![tool_json("search", "searches")]).spawn(server_io);

        let connection = ServerConnection::connect_for_test("alpha", client_io)
            .await
            .expect("handshake should succeed");
        connection.close().await;
        connection.close().await;
        assert_eq!(connection.state(), SessionState::Closed);

        let err = connection
            .call_tool("search", serde_json::Map::new())
            .await
            .expect_err("calls after close should fail");
        assert!(err.contains("not ready"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn connect_to_missing_command_reports_spawn_error() {
        let config = McpServerConfig {
            name: "missing".to_string(),
            command: "/definitely-missing-command".to_string(),
            args: Vec::new(),
            env: std::collections::HashMap::new(),
            enabled: None,
        };
        let err = ServerConnection::connect(&config)
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, ConnectError::Spawn { .. }));
    }

    #[tokio::test]
    async fn connect_to_non_mcp_command_fails_handshake() {
        // `true` exits immediately, so the handshake sees EOF instead of an
        // initialize response.
        let config = McpServerConfig {
            name: "not-mcp".to_string(),
            command: "true".to_string(),
            args: Vec::new(),
            env: std::collections::HashMap::new(),
            enabled: None,
        };
        let err = ServerConnection::connect(&config)
            .await
            .expect_err("handshake should fail");
        assert!(matches!(err, ConnectError::Handshake { .. }));
    }
}
