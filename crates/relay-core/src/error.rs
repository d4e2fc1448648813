//! Error taxonomy shared by both transports.

use serde_json::Value;

// ── Error code constants ────────────────────────────────────────────

/// Malformed URL, malformed envelope, or duplicate subscription id.
pub const BAD_REQUEST: &str = "BAD_REQUEST";
/// Request body exceeded the configured limit.
pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
/// Transport aborted while the request was being read.
pub const CLIENT_CLOSED_REQUEST: &str = "CLIENT_CLOSED_REQUEST";
/// Envelope decode failure.
pub const PARSE_ERROR: &str = "PARSE_ERROR";
/// Unexpected internal error.
pub const INTERNAL_SERVER_ERROR: &str = "INTERNAL_SERVER_ERROR";

/// Error type carried across the bridge.
///
/// Application errors from the dispatch engine use [`RelayError::App`] and
/// are forwarded to clients as-is. All variants are `Clone` so a single
/// failure (e.g. context resolution) can be delivered to every waiter.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    /// Malformed request: bad URL, bad envelope shape, duplicate id.
    #[error("{message}")]
    BadRequest {
        /// Description of what is malformed.
        message: String,
    },

    /// Body exceeded the configured maximum size.
    #[error("request body exceeded {limit} bytes")]
    PayloadTooLarge {
        /// The configured limit that was exceeded.
        limit: usize,
    },

    /// The client went away mid-request.
    #[error("client closed request")]
    ClientClosedRequest,

    /// The incoming frame was not valid JSON.
    #[error("{message}")]
    Parse {
        /// Decode failure description.
        message: String,
    },

    /// Unexpected server-side failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Application-defined error from the dispatch engine, forwarded as-is.
    #[error("{message}")]
    App {
        /// Machine-readable code chosen by the application.
        code: String,
        /// Human-readable message.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },
}

impl RelayError {
    /// Shorthand for a [`RelayError::BadRequest`].
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Shorthand for a [`RelayError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for a [`RelayError::Parse`].
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &str {
        match self {
            Self::BadRequest { .. } => BAD_REQUEST,
            Self::PayloadTooLarge { .. } => PAYLOAD_TOO_LARGE,
            Self::ClientClosedRequest => CLIENT_CLOSED_REQUEST,
            Self::Parse { .. } => PARSE_ERROR,
            Self::Internal { .. } => INTERNAL_SERVER_ERROR,
            Self::App { code, .. } => code,
        }
    }

    /// HTTP status the unary transport maps this error to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest { .. } | Self::Parse { .. } => 400,
            Self::PayloadTooLarge { .. } => 413,
            Self::ClientClosedRequest => 499,
            Self::Internal { .. } | Self::App { .. } => 500,
        }
    }

    /// Optional structured details (application errors only).
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::App { data, .. } => data.as_ref(),
            _ => None,
        }
    }
}
