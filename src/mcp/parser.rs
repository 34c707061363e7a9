use crate::mcp::registry::ToolRegistry;
use memchr::memchr_iter;
use serde_json::{Map, Value};
use tracing::debug;

/// A tool invocation extracted from model output and resolved against the
/// registry. The owning server comes from the registry's descriptor, never
/// from the model text, so a crafted response cannot redirect a call to a
/// different server under the same tool name.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// Extracts a tool call of the shape `{"tool": <name>, "arguments": {...}}`
/// embedded anywhere in free-form model text, possibly spanning lines.
///
/// The scan is brace-balanced rather than regex-based: the first balanced
/// JSON object carrying a string `"tool"` key wins, and braces inside string
/// literals do not confuse it. Total on any input — malformed JSON, a
/// missing or mistyped `"tool"` key, or a tool name the registry does not
/// know all yield `None`, which callers treat as an ordinary chat message.
pub fn extract_tool_call(registry: &ToolRegistry, text: &str) -> Option<ToolCallRequest> {
    let candidate = find_tool_call_json(text)?;
    let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) else {
        return None;
    };
    let tool_name = object.get("tool").and_then(Value::as_str)?;

    let Some(descriptor) = registry.lookup(tool_name) else {
        debug!(tool = %tool_name, "model referenced an unknown tool");
        return None;
    };

    let arguments = match object.get("arguments") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return None,
        None => Map::new(),
    };

    Some(ToolCallRequest {
        server_name: descriptor.server_name.clone(),
        tool_name: tool_name.to_string(),
        arguments,
    })
}

/// Locates the first balanced JSON object in `text` that parses and carries
/// a `"tool"` key, returning the raw slice.
pub fn find_tool_call_json(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    for start in memchr_iter(b'{', bytes) {
        let Some(end) = matching_brace(bytes, start) else {
            continue;
        };
        let candidate = &text[start..=end];
        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        if object.contains_key("tool") {
            return Some(candidate);
        }
    }
    None
}

/// Index of the brace closing the object opened at `start`, skipping string
/// literals and escape sequences.
fn matching_brace(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}
