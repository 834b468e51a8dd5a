//! # mcp-remote
//!
//! A local authentication-brokering proxy for the Model Context Protocol.
//! It lets a stdio-only MCP client reach a remote MCP server whose HTTP or
//! SSE transport sits behind OAuth 2.0: the proxy discovers the server's
//! authorization metadata, runs the interactive authorization-code exchange
//! through a loopback browser redirect, persists and refreshes tokens, and
//! then forwards JSON-RPC traffic in both directions.
//!
//! Several proxies launched for the same remote coordinate through a
//! per-server lockfile so only one of them opens a browser; the rest wait
//! and pick the tokens up from disk.
//!
//! The crate ships two binaries: `mcp-remote` (the proxy) and
//! `mcp-remote-client` (the same connection path driven as a standalone
//! test client).

pub mod args;
pub mod auth;
pub mod callback;
pub mod codec;
pub mod coordinator;
pub mod discovery;
pub mod driver;
pub mod error;
pub mod filter;
pub mod http;
pub mod jsonrpc;
pub mod logging;
pub mod proxy;
pub mod selector;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
