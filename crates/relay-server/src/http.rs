//! Axum gateway for the unary transport.
//!
//! Bridges an Axum request onto the exchange adapter: the request body
//! streams into the exchange chunk channel, and the adapter's response sink
//! streams back out as the Axum response body.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::Response as AxumResponse;
use futures::StreamExt;
use relay_http::{handle_exchange, AdaptOptions, BodyChunk, ChannelSink, ExchangeParts};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::server::AppState;

/// Handle one unary procedure request.
pub async fn procedure_handler<Ctx: Send + Sync + 'static>(
    State(state): State<AppState<Ctx>>,
    req: axum::extract::Request,
) -> AxumResponse {
    let (parts, body) = req.into_parts();
    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let (xparts, handles) = ExchangeParts::new(
        parts.method.as_str(),
        parts.uri.path(),
        parts.uri.query().unwrap_or_default(),
        headers,
        16,
    );

    // Feed request body frames into the exchange. An upstream error means
    // the client went away: flip the abort token so pending reads terminate.
    drop(tokio::spawn(async move {
        let mut frames = body.into_data_stream();
        loop {
            let item = tokio::select! {
                () = handles.read_release.cancelled() => break,
                item = frames.next() => item,
            };
            match item {
                Some(Ok(bytes)) => {
                    if handles.body.send(BodyChunk::data(bytes)).await.is_err() {
                        break;
                    }
                }
                Some(Err(_)) => {
                    handles.abort.cancel();
                    break;
                }
                None => {
                    let _ = handles.body.send(BodyChunk::last("")).await;
                    break;
                }
            }
        }
    }));

    let (sink, head_rx, body_rx) = ChannelSink::new(16);
    let dispatcher = Arc::clone(&state.dispatcher);
    let factory = Arc::clone(&state.context_factory);
    let opts = AdaptOptions {
        max_body_size: state.config.max_body_size,
        encrypted: state.config.encrypted,
    };
    drop(tokio::spawn(async move {
        let mut sink = sink;
        handle_exchange(
            xparts,
            &mut sink,
            dispatcher.as_ref(),
            factory.as_ref(),
            &opts,
        )
        .await;
    }));

    match head_rx.await {
        Ok(head) => {
            let stream = ReceiverStream::new(body_rx).map(Ok::<_, std::convert::Infallible>);
            let mut response = AxumResponse::new(Body::from_stream(stream));
            *response.status_mut() =
                StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            for (name, value) in head.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(name.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    let _ = response.headers_mut().append(name, value);
                }
            }
            response
        }
        Err(_) => {
            // The exchange aborted before a head was written.
            debug!("exchange produced no response head");
            let mut response = AxumResponse::new(Body::empty());
            *response.status_mut() =
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            response
        }
    }
}
