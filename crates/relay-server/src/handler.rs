//! Frame processing and the per-id subscription state machine.

use std::sync::Arc;

use futures::StreamExt;
use relay_core::{ContextSlot, DispatchReply, Dispatcher, ProcedureKind, RelayError, ValueStream};
use relay_wire::{
    decode_text, parse_request, ClientRequest, RequestId, RequestParams, ResponseEnvelope,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{ClientConnection, SubscriptionHandle};

/// Process one physical text frame.
///
/// A frame is one envelope or an array of envelopes; each envelope is
/// parsed and dispatched independently and concurrently, so responses for
/// independent ids may complete out of arrival order. A frame that fails to
/// parse yields a single null-id `PARSE_ERROR` response and no envelope is
/// processed.
pub fn process_frame<Ctx: Send + Sync + 'static>(
    text: &str,
    conn: &Arc<ClientConnection>,
    ctx: &ContextSlot<Ctx>,
    dispatcher: &Arc<dyn Dispatcher<Ctx>>,
) {
    let values = match decode_text(text) {
        Ok(values) => values,
        Err(err) => {
            warn!(conn_id = %conn.id, "unparseable frame");
            let _ = conn.send_envelope(&ResponseEnvelope::error(None, &err));
            return;
        }
    };

    for value in values {
        match parse_request(&value) {
            Ok(request) => {
                let conn = Arc::clone(conn);
                let ctx = ctx.clone();
                let dispatcher = Arc::clone(dispatcher);
                drop(tokio::spawn(async move {
                    handle_request(request, conn, ctx, dispatcher).await;
                }));
            }
            Err((id, err)) => {
                debug!(conn_id = %conn.id, code = err.code(), "malformed envelope");
                let _ = conn.send_envelope(&ResponseEnvelope::error(id, &err));
            }
        }
    }
}

async fn handle_request<Ctx: Send + Sync + 'static>(
    request: ClientRequest,
    conn: Arc<ClientConnection>,
    ctx: ContextSlot<Ctx>,
    dispatcher: Arc<dyn Dispatcher<Ctx>>,
) {
    match request {
        ClientRequest::Stop { id } => handle_stop(&conn, id),
        ClientRequest::Call { id, kind, params } => {
            handle_call(id, kind, params, conn, ctx, dispatcher).await;
        }
    }
}

/// Cancel the subscription registered under `id`, if any.
///
/// Stopping an unknown id is a no-op, which makes client-side stop retries
/// idempotent.
fn handle_stop(conn: &Arc<ClientConnection>, id: RequestId) {
    if let Some(handle) = conn.take_subscription(&id) {
        handle.cancel();
        debug!(conn_id = %conn.id, %id, "subscription stopped by client");
        let _ = conn.send_envelope(&ResponseEnvelope::stopped(id));
    }
}

async fn handle_call<Ctx: Send + Sync + 'static>(
    id: RequestId,
    kind: ProcedureKind,
    params: RequestParams,
    conn: Arc<ClientConnection>,
    ctx: ContextSlot<Ctx>,
    dispatcher: Arc<dyn Dispatcher<Ctx>>,
) {
    // Queue behind context resolution. A failed resolution is reported once
    // at connection scope (see session teardown), not per request.
    let ctx = match ctx.get().await {
        Ok(ctx) => ctx,
        Err(err) => {
            debug!(conn_id = %conn.id, %id, code = err.code(), "dropping request, no context");
            return;
        }
    };

    let reply = dispatcher
        .dispatch(&params.path, params.input, &ctx, kind)
        .await;

    match reply {
        Err(err) => {
            let _ = conn.send_envelope(&ResponseEnvelope::error(Some(id), &err));
        }
        Ok(DispatchReply::Value(value)) => {
            if kind == ProcedureKind::Subscription {
                let err =
                    RelayError::internal("subscription procedure did not produce a stream");
                let _ = conn.send_envelope(&ResponseEnvelope::error(Some(id), &err));
            } else {
                let _ = conn.send_envelope(&ResponseEnvelope::data(id, value));
            }
        }
        Ok(DispatchReply::Stream(stream)) => {
            if kind == ProcedureKind::Subscription {
                start_subscription(id, stream, conn);
            } else {
                let err = RelayError::internal(format!(
                    "{kind} procedure produced a stream"
                ));
                let _ = conn.send_envelope(&ResponseEnvelope::error(Some(id), &err));
            }
        }
    }
}

/// Register a new subscription and begin forwarding its stream.
fn start_subscription(id: RequestId, stream: ValueStream, conn: Arc<ClientConnection>) {
    let cancel = CancellationToken::new();
    if let Err(existing) =
        conn.register_subscription(id.clone(), SubscriptionHandle::new(cancel.clone()))
    {
        // Duplicate id: terminate the old subscription first, silently, then
        // reject the new request. The new stream is dropped unconsumed.
        existing.cancel();
        warn!(conn_id = %conn.id, %id, "duplicate subscription id");
        let err = RelayError::bad_request(format!("duplicate id '{id}'"));
        let _ = conn.send_envelope(&ResponseEnvelope::error(Some(id), &err));
        return;
    }

    // `started` is enqueued before the forwarding task exists, so it always
    // precedes the subscription's own data.
    let _ = conn.send_envelope(&ResponseEnvelope::started(id.clone()));
    drop(tokio::spawn(forward_stream(id, stream, conn, cancel)));
}

/// Forward stream items to the client until a terminal event.
///
/// Cancellation ends the task without emitting anything; whichever path
/// removed the subscription from the map owns the final envelope.
async fn forward_stream(
    id: RequestId,
    mut stream: ValueStream,
    conn: Arc<ClientConnection>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(value)) => {
                if !conn.send_envelope(&ResponseEnvelope::data(id.clone(), value)) {
                    debug!(conn_id = %conn.id, %id, "subscription data dropped");
                }
            }
            Some(Err(err)) => {
                if conn.take_subscription(&id).is_some() {
                    let _ = conn.send_envelope(&ResponseEnvelope::error(Some(id), &err));
                }
                return;
            }
            None => {
                if conn.take_subscription(&id).is_some() {
                    let _ = conn.send_envelope(&ResponseEnvelope::stopped(id));
                }
                return;
            }
        }
    }
}

/// Tear down every subscription owned by a closed connection.
///
/// Each unsubscribe capability is invoked exactly once and no envelope is
/// sent: the socket is gone.
pub fn cleanup_connection(conn: &ClientConnection) {
    let handles = conn.drain_subscriptions();
    if !handles.is_empty() {
        debug!(conn_id = %conn.id, count = handles.len(), "cancelling subscriptions on close");
    }
    for handle in handles {
        handle.cancel();
    }
}
