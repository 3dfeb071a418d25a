//! `OpenAPI` -> MCP tooling for `mcp-relay`.
//!
//! - [`converter`] turns an `OpenAPI` document into tool definitions plus an operation lookup.
//! - [`executor`] issues the HTTP request behind one tool call for one connection.
//! - [`proxy`] pairs both behind a typed `list_tools` / `call_tool` interface.
//!
//! It intentionally contains **no** session or transport logic.

pub mod config;
pub mod converter;
pub mod error;
pub mod executor;
pub mod proxy;
pub mod resolver;
pub mod safety;
pub mod schema;
pub mod semantics;
