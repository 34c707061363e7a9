use crate::mcp::registry::ToolRegistry;

/// Marker replaced with the rendered tool descriptions when building the
/// system prompt.
pub const TOOLS_PLACEHOLDER: &str = "{TOOLS}";

/// Default instructions advertising the available tools to the model.
pub const DEFAULT_TOOLS_TEMPLATE: &str = "\
You have access to external tools. To use one, include a single JSON object \
of the form {\"tool\": \"<name>\", \"arguments\": {...}} anywhere in your \
reply. Only call tools from the list below, and only when the user's request \
needs one.

Available tools:
{TOOLS}
";

/// Splices the registry's tool descriptions into `template` at the
/// [`TOOLS_PLACEHOLDER`] marker.
///
/// An empty registry yields an empty string: the caller must omit the tools
/// section from the prompt entirely rather than emit empty scaffolding.
pub fn render_tools_section(template: &str, registry: &ToolRegistry) -> String {
    let tools = registry.describe_all();
    if tools.is_empty() {
        return String::new();
    }
    template.replace(TOOLS_PLACEHOLDER, &tools)
}
