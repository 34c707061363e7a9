//! Toolbridge wires a chat assistant to externally-running Model Context
//! Protocol (MCP) tool servers: child processes launched over stdio whose
//! callable tools are discovered at startup.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core::config`] models the `mcpServers` configuration document and
//!   loads it leniently (malformed input degrades to an empty server set).
//! - [`mcp::client`] owns one server subprocess and its MCP session:
//!   handshake, tool listing, tool calls, and teardown.
//! - [`mcp::registry`] connects every configured server, indexes the
//!   discovered tools, and renders their descriptions for prompt building.
//! - [`mcp::parser`] extracts an embedded tool-call request from free-form
//!   model output.
//! - [`mcp::permissions`] tracks which tools each conversation has
//!   pre-authorized.
//! - [`mcp::orchestrator`] is the façade the conversation loop talks to:
//!   it parses, gates, executes, and normalizes tool results.
//! - [`prompt`] splices the registry's tool descriptions into a prompt
//!   template for advertising tools to the model.

pub mod core;
pub mod mcp;
pub mod prompt;
pub mod utils;
