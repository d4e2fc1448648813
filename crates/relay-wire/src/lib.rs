//! # relay-wire
//!
//! Wire-format envelopes for the duplex transport and their codec.
//!
//! Incoming frames decode into [`ClientRequest`] sum types at the boundary;
//! outgoing records encode from [`ResponseEnvelope`] /
//! [`NotificationEnvelope`]. Nothing deeper in the pipeline inspects raw
//! JSON shapes.

#![deny(unsafe_code)]

pub mod codec;
pub mod types;

pub use codec::{decode_frame, decode_text, parse_request};
pub use types::{
    ClientRequest, ErrorBody, NotificationEnvelope, RequestId, RequestParams, ResponseBody,
    ResponseEnvelope, ResultPayload,
};
