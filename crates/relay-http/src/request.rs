//! Adaptation of a native exchange into an immutable request object.

use relay_core::{RelayError, RequestInfo};
use url::Url;

use crate::body::BodyReader;
use crate::exchange::ExchangeParts;

/// Reserved pseudo-header prefix; such headers never reach the application.
const PSEUDO_HEADER_PREFIX: char = ':';

/// Options controlling request adaptation.
#[derive(Clone, Debug, Default)]
pub struct AdaptOptions {
    /// Maximum request body size in bytes; `None` means unlimited.
    pub max_body_size: Option<usize>,
    /// Whether the listening transport is TLS (selects the URL scheme).
    pub encrypted: bool,
}

/// Immutable request derived from one native exchange.
#[derive(Debug)]
pub struct Request {
    /// Upper-cased method.
    pub method: String,
    /// Fully constructed target URL.
    pub url: Url,
    /// Ordered multi-value headers, pseudo-headers dropped.
    pub headers: Vec<(String, String)>,
    /// Lazy request body; already closed for GET/HEAD.
    pub body: BodyReader,
}

impl Request {
    /// Request description for the context factory.
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            method: self.method.clone(),
            path: self.url.path().to_owned(),
            query: self.url.query().unwrap_or_default().to_owned(),
            headers: self.headers.clone(),
        }
    }
}

/// Convert a native exchange into a [`Request`].
///
/// The URL scheme follows `opts.encrypted`, the host comes from the `host`
/// header (defaulting to `localhost`), and a non-empty query string is
/// always appended. URL construction failures are `BAD_REQUEST` carrying
/// the parse error.
pub fn adapt(parts: ExchangeParts, opts: &AdaptOptions) -> Result<Request, RelayError> {
    let method = parts.method.to_ascii_uppercase();

    let scheme = if opts.encrypted { "https" } else { "http" };
    let host = parts
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map_or("localhost", |(_, value)| value.as_str());
    let target = if parts.query.is_empty() {
        format!("{scheme}://{host}{}", parts.path)
    } else {
        format!("{scheme}://{host}{}?{}", parts.path, parts.query)
    };
    let url = Url::parse(&target)
        .map_err(|e| RelayError::bad_request(format!("invalid request URL '{target}': {e}")))?;

    let headers: Vec<(String, String)> = parts
        .headers
        .into_iter()
        .filter(|(name, _)| !name.starts_with(PSEUDO_HEADER_PREFIX))
        .collect();

    let body = if method == "GET" || method == "HEAD" {
        BodyReader::closed()
    } else {
        BodyReader::new(
            parts.body,
            parts.abort.clone(),
            parts.read_release.clone(),
            opts.max_body_size,
        )
    };

    Ok(Request {
        method,
        url,
        headers,
        body,
    })
}
