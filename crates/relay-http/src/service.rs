//! Unary dispatch: one exchange in, one envelope response out.

use relay_core::{ContextFactory, DispatchReply, Dispatcher, ProcedureKind, RelayError};
use relay_wire::{ErrorBody, ResponseBody as WireBody, ResultPayload};
use serde_json::Value;
use tracing::debug;

use crate::body::BodyReader;
use crate::exchange::{ExchangeParts, ResponseSink};
use crate::request::{adapt, AdaptOptions};
use crate::respond::{send, Response};

async fn run<Ctx: Send + Sync>(
    parts: ExchangeParts,
    dispatcher: &dyn Dispatcher<Ctx>,
    factory: &dyn ContextFactory<Ctx>,
    opts: &AdaptOptions,
) -> Result<Value, RelayError> {
    let mut request = adapt(parts, opts)?;
    let info = request.info();
    let ctx = factory.create_context(&info).await?;

    let kind = match request.method.as_str() {
        "GET" => ProcedureKind::Query,
        "POST" => ProcedureKind::Mutation,
        other => {
            return Err(RelayError::bad_request(format!(
                "unsupported method '{other}'"
            )));
        }
    };
    let path = request.url.path().trim_start_matches('/').to_owned();

    let input = match kind {
        ProcedureKind::Query => match request.url.query_pairs().find(|(k, _)| k == "input") {
            Some((_, raw)) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| RelayError::parse(format!("invalid input parameter: {e}")))?,
            ),
            None => None,
        },
        _ => {
            let body = std::mem::replace(&mut request.body, BodyReader::closed());
            let bytes = body.concat().await?;
            if bytes.is_empty() {
                None
            } else {
                Some(
                    serde_json::from_slice(&bytes)
                        .map_err(|e| RelayError::parse(format!("invalid request body: {e}")))?,
                )
            }
        }
    };

    match dispatcher.dispatch(&path, input, &ctx, kind).await? {
        DispatchReply::Value(value) => Ok(value),
        DispatchReply::Stream(_) => Err(RelayError::internal(
            "dispatch produced a stream for a unary procedure",
        )),
    }
}

/// Handle one unary exchange end to end.
///
/// Adapts the exchange, creates a per-exchange context, dispatches, and
/// writes one envelope response: `{"result":{"type":"data","data":..}}` on
/// success, `{"error":{..}}` with the mapped HTTP status on failure. A
/// transport abort short-circuits silently; it is never surfaced to the
/// dispatcher as an error response.
pub async fn handle_exchange<Ctx: Send + Sync>(
    parts: ExchangeParts,
    sink: &mut dyn ResponseSink,
    dispatcher: &dyn Dispatcher<Ctx>,
    factory: &dyn ContextFactory<Ctx>,
    opts: &AdaptOptions,
) {
    let abort = parts.abort.clone();
    let response = match run(parts, dispatcher, factory, opts).await {
        Ok(value) => {
            let body = WireBody::Result {
                result: ResultPayload::Data { data: value },
            };
            Response::json(200, &serde_json::to_value(&body).unwrap_or_default())
        }
        Err(RelayError::ClientClosedRequest) => {
            debug!("client closed request; dropping response");
            return;
        }
        Err(err) => {
            debug!(code = err.code(), "unary dispatch failed");
            let status = err.http_status();
            let body = WireBody::Error {
                error: ErrorBody::from(&err),
            };
            Response::json(status, &serde_json::to_value(&body).unwrap_or_default())
        }
    };
    send(sink, &abort, response).await;
}
