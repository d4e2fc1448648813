//! # relay-core
//!
//! Boundary types shared by every relay transport:
//!
//! - [`RelayError`] — the typed error taxonomy carried across the bridge
//! - [`Dispatcher`] — the black-box procedure dispatch engine
//! - [`ContextFactory`] / [`ContextSlot`] — per-request and per-connection
//!   context construction with queued waiters

#![deny(unsafe_code)]

pub mod context;
pub mod dispatch;
pub mod error;

pub use context::{ContextFactory, ContextSlot, RequestInfo};
pub use dispatch::{DispatchReply, Dispatcher, ProcedureKind, ValueStream};
pub use error::RelayError;
