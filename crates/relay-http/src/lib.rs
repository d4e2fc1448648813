//! # relay-http
//!
//! Adapts a callback-driven, chunked, abortable native HTTP exchange into a
//! single-object Request/Response abstraction consumable by the dispatch
//! engine.
//!
//! The native transaction is re-expressed as channel receives and
//! cancellation tokens ([`ExchangeParts`]): one chunk channel for the
//! request body, one token for transport abort, one token for releasing the
//! read side early. The write half is a [`ResponseSink`] with an atomic
//! head region and a `try_write`/`writable` backpressure pair.

#![deny(unsafe_code)]

pub mod body;
pub mod exchange;
pub mod request;
pub mod respond;
pub mod service;

pub use body::BodyReader;
pub use exchange::{
    BodyChunk, ChannelSink, ExchangeHandles, ExchangeParts, ResponseHead, ResponseSink,
    WriteOutcome,
};
pub use request::{adapt, AdaptOptions, Request};
pub use respond::{send, Response, ResponseBody};
pub use service::handle_exchange;
