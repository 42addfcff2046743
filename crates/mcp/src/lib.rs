//! MCP (Model Context Protocol) support for relay.
//!
//! Both directions of the protocol over JSON-RPC 2.0: a client that keeps
//! long-lived connections to external tool servers, and a server that
//! exposes the local tool registry to other agents.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 and MCP-specific protocol types
//! - **transport**: stdio, subprocess, SSE, streamable HTTP and in-memory transports
//! - **client**: request/response correlation over one transport
//! - **server**: `McpServer` wrapping a `ToolRegistry`
//! - **config**: persisted server records
//! - **manager**: per-server connection state, backoff reconnects, tool namespacing

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod server;
pub mod transport;
pub mod types;

pub use client::{ClientEvent, McpClient};
pub use config::{expand_env_vars, load_servers, parse_servers, ServerRecord, TransportConfig};
pub use error::McpError;
pub use manager::{BackoffPolicy, ConnectionState, ConnectionStatus, McpManager, ServerSummary};
pub use server::{McpServer, ToolsChangedNotifier};
pub use transport::{
    ChannelTransport, ChildProcessTransport, DefaultTransportFactory, McpTransport, SseTransport,
    StdioTransport, StreamableHttpTransport, TransportFactory,
};
