//! # relay-server
//!
//! Axum HTTP + WebSocket gateway in front of a dispatch engine.
//!
//! - WebSocket multiplexer: many concurrent logical subscriptions over one
//!   physical connection, keyed by request id
//! - Connection registry with out-of-band broadcast (`reconnect`)
//! - Unary procedure gateway bridging Axum onto the exchange adapter
//! - Health endpoint, serde config, graceful shutdown via
//!   `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod handler;
pub mod health;
pub mod http;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use connection::{ClientConnection, SubscriptionHandle};
pub use registry::ConnectionRegistry;
pub use server::{AppState, RelayServer};
pub use shutdown::Shutdown;
