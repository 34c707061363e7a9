use crate::mcp::parser::{self, ToolCallRequest};
use crate::mcp::permissions::PermissionGate;
use crate::mcp::registry::ToolRegistry;
use rust_mcp_schema::ContentBlock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What happened to one piece of model output.
///
/// These four variants are the whole contract consumed by the chat layer:
/// pass the text through as ordinary chat (`NotATool`), prompt the user for
/// permission (`AwaitingPermission`), show a tool result (`Completed`), or
/// show a generic failure (`Failed`).
#[derive(Debug)]
pub enum OrchestrationOutcome {
    NotATool,
    AwaitingPermission(PendingToolCall),
    Completed(String),
    Failed(String),
}

/// Result of executing (or declining to execute) one tool call.
#[derive(Debug)]
pub enum ToolCallOutcome {
    Success(String),
    Denied,
    ExecutionError(String),
}

/// A parsed tool call waiting on a user decision, pinned to the
/// conversation and its epoch at parse time. The caller passes this exact
/// value back to one of the approve/deny follow-ups; the orchestrator never
/// re-derives it from text, since registry state could change between the
/// prompt and the decision.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub conversation_id: String,
    pub request: ToolCallRequest,
    epoch: u64,
}

struct ConversationState {
    epoch: u64,
    cancel: CancellationToken,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            epoch: 0,
            cancel: CancellationToken::new(),
        }
    }
}

/// The façade between the conversation loop and the MCP stack: given model
/// output, decides whether a tool call is present, resolves permission,
/// executes against the right connection, and normalizes the result.
///
/// Collaborators are injected at construction; the orchestrator owns the
/// permission gate and the per-conversation epoch bookkeeping, while the
/// registry is read-shared across every conversation in the process.
pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    permissions: PermissionGate,
    conversations: RwLock<HashMap<String, ConversationState>>,
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            permissions: PermissionGate::default(),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn permissions(&self) -> &PermissionGate {
        &self.permissions
    }

    /// Analyzes one completed model message.
    ///
    /// Returns `Some(NotATool)` when no (known) tool call is embedded,
    /// `Some(AwaitingPermission(..))` when the user must decide, and
    /// `Some(Completed(..))`/`Some(Failed(..))` when the pair was already
    /// authorized and the call ran. `None` means the conversation ended
    /// while the call was in flight; the result has been discarded and
    /// nothing should be delivered.
    pub async fn handle_model_output(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Option<OrchestrationOutcome> {
        let Some(request) = parser::extract_tool_call(&self.registry, text) else {
            return Some(OrchestrationOutcome::NotATool);
        };
        debug!(
            conversation = %conversation_id,
            server = %request.server_name,
            tool = %request.tool_name,
            "model requested a tool call"
        );

        let pending = PendingToolCall {
            conversation_id: conversation_id.to_string(),
            epoch: self.conversation_epoch(conversation_id),
            request,
        };

        if self.permissions.is_allowed(
            conversation_id,
            &pending.request.server_name,
            &pending.request.tool_name,
        ) {
            self.execute(pending).await
        } else {
            Some(OrchestrationOutcome::AwaitingPermission(pending))
        }
    }

    /// User chose "allow for this conversation": record the grant, then run.
    pub async fn approve_for_conversation(
        &self,
        pending: PendingToolCall,
    ) -> Option<OrchestrationOutcome> {
        self.permissions.grant(
            &pending.conversation_id,
            &pending.request.server_name,
            &pending.request.tool_name,
        );
        self.execute(pending).await
    }

    /// User chose "allow once": run without recording anything.
    pub async fn approve_once(&self, pending: PendingToolCall) -> Option<OrchestrationOutcome> {
        self.execute(pending).await
    }

    /// User declined: nothing executes, no grant is recorded, and the caller
    /// resumes normal chat handling of the original message.
    pub fn deny(&self, pending: PendingToolCall) -> OrchestrationOutcome {
        debug!(
            conversation = %pending.conversation_id,
            tool = %pending.request.tool_name,
            "tool call denied"
        );
        map_outcome(ToolCallOutcome::Denied, &pending.request.tool_name)
    }

    /// Ends a conversation: its permission scope is dropped, its epoch moves
    /// on, and any in-flight tool call is cancelled — a late completion for
    /// the old epoch is discarded instead of delivered.
    pub fn end_conversation(&self, conversation_id: &str) {
        self.permissions.clear_conversation(conversation_id);
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let state = conversations
            .entry(conversation_id.to_string())
            .or_default();
        state.epoch += 1;
        state.cancel.cancel();
        state.cancel = CancellationToken::new();
        debug!(conversation = %conversation_id, epoch = state.epoch, "conversation ended");
    }

    async fn execute(&self, pending: PendingToolCall) -> Option<OrchestrationOutcome> {
        let cancel = self.cancel_token(&pending.conversation_id);
        let outcome = self.run_tool(&pending, &cancel).await;

        if !self.is_current(&pending) {
            debug!(
                conversation = %pending.conversation_id,
                tool = %pending.request.tool_name,
                "discarding tool result for an ended conversation"
            );
            return None;
        }
        Some(map_outcome(outcome, &pending.request.tool_name))
    }

    async fn run_tool(
        &self,
        pending: &PendingToolCall,
        cancel: &CancellationToken,
    ) -> ToolCallOutcome {
        let request = &pending.request;
        let Some(connection) = self.registry.connection_for(&request.server_name) else {
            let reason = match self.registry.last_error(&request.server_name) {
                Some(err) => format!(
                    "MCP server {} is not available: {}",
                    request.server_name, err
                ),
                None => format!("MCP server {} is not available.", request.server_name),
            };
            return ToolCallOutcome::ExecutionError(reason);
        };

        let call = connection.call_tool(&request.tool_name, request.arguments.clone());
        match run_cancellable(cancel, call).await {
            Ok(result) => {
                if result.is_error.unwrap_or(false) {
                    ToolCallOutcome::ExecutionError(join_content(&result.content))
                } else {
                    ToolCallOutcome::Success(join_content(&result.content))
                }
            }
            Err(reason) => ToolCallOutcome::ExecutionError(reason),
        }
    }

    fn conversation_epoch(&self, conversation_id: &str) -> u64 {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .epoch
    }

    fn cancel_token(&self, conversation_id: &str) -> CancellationToken {
        let mut conversations = self
            .conversations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .cancel
            .clone()
    }

    fn is_current(&self, pending: &PendingToolCall) -> bool {
        let conversations = self
            .conversations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        conversations
            .get(&pending.conversation_id)
            .map(|state| state.epoch == pending.epoch)
            .unwrap_or(true)
    }
}

fn map_outcome(outcome: ToolCallOutcome, tool_name: &str) -> OrchestrationOutcome {
    match outcome {
        ToolCallOutcome::Success(text) => OrchestrationOutcome::Completed(text),
        ToolCallOutcome::Denied => OrchestrationOutcome::NotATool,
        ToolCallOutcome::ExecutionError(reason) => {
            OrchestrationOutcome::Failed(format!("Tool {} failed: {}", tool_name, reason))
        }
    }
}

async fn run_cancellable<F, T>(cancel_token: &CancellationToken, operation: F) -> Result<T, String>
where
    F: Future<Output = Result<T, String>>,
{
    tokio::select! {
        _ = cancel_token.cancelled() => Err("MCP operation interrupted.".to_string()),
        result = operation => result,
    }
}

/// Joins a tool response's textual content parts with newlines. Non-text
/// parts fall back to their raw JSON rendering — lossy, but the transcript
/// stays self-contained.
fn join_content(content: &[ContentBlock]) -> String {
    content
        .iter()
        .map(|block| match block {
            ContentBlock::TextContent(text) => text.text.clone(),
            other => serde_json::to_string(other)
                .unwrap_or_else(|_| "Unsupported tool content.".to_string()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
