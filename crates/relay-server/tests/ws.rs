//! End-to-end tests using a real WebSocket client against a bound server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::{
    ContextFactory, DispatchReply, Dispatcher, ProcedureKind, RelayError, RequestInfo,
};
use relay_server::{RelayServer, ServerConfig};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const TICK: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Guard owned by dispatcher streams so their teardown is observable.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        let _ = counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct IntegrationDispatcher {
    active_streams: Arc<AtomicUsize>,
}

#[async_trait]
impl Dispatcher<String> for IntegrationDispatcher {
    async fn dispatch(
        &self,
        path: &str,
        input: Option<Value>,
        ctx: &String,
        kind: ProcedureKind,
    ) -> Result<DispatchReply, RelayError> {
        match path {
            "echo" => Ok(DispatchReply::Value(json!({
                "input": input,
                "ctx": ctx,
                "kind": kind.as_str(),
            }))),
            // Emits two values, then stays open until stopped.
            "onMessage" => {
                let guard = ActiveGuard::new(&self.active_streams);
                Ok(DispatchReply::Stream(Box::pin(async_stream::stream! {
                    let _guard = guard;
                    yield Ok(json!("hello"));
                    yield Ok(json!("world"));
                    futures::future::pending::<()>().await;
                })))
            }
            // Emits two values, then completes on its own.
            "finite" => {
                let guard = ActiveGuard::new(&self.active_streams);
                Ok(DispatchReply::Stream(Box::pin(async_stream::stream! {
                    let _guard = guard;
                    yield Ok(json!(1));
                    yield Ok(json!(2));
                })))
            }
            // Never completes.
            "ticker" => {
                let guard = ActiveGuard::new(&self.active_streams);
                Ok(DispatchReply::Stream(Box::pin(async_stream::stream! {
                    let _guard = guard;
                    let mut n = 0u64;
                    loop {
                        yield Ok(json!(n));
                        n += 1;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })))
            }
            other => Err(RelayError::bad_request(format!("unknown path '{other}'"))),
        }
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    server: Arc<RelayServer<String>>,
    active_streams: Arc<AtomicUsize>,
}

/// Boot a test server on a random port.
async fn boot() -> Harness {
    let active_streams = Arc::new(AtomicUsize::new(0));
    let dispatcher: Arc<dyn Dispatcher<String>> = Arc::new(IntegrationDispatcher {
        active_streams: Arc::clone(&active_streams),
    });
    let factory: Arc<dyn ContextFactory<String>> = Arc::new(|info: RequestInfo| async move {
        if info
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("x-fail-ctx"))
        {
            Err(RelayError::bad_request("context refused"))
        } else {
            Ok("user-1".to_string())
        }
    });
    let config = ServerConfig {
        close_grace_ms: 50,
        ..ServerConfig::default()
    };
    let server = Arc::new(RelayServer::new(config, dispatcher, factory));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    drop(tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    }));

    Harness {
        addr,
        server,
        active_streams,
    }
}

async fn connect(harness: &Harness) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{}/ws", harness.addr))
        .await
        .unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: &Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TICK, ws.next()).await.unwrap().unwrap().unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Wait until `cond` holds or the deadline passes.
async fn wait_for(mut cond: impl FnMut() -> bool) {
    timeout(TICK, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn query_roundtrip_over_ws() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(
        &mut ws,
        &json!({"id": "q1", "method": "query", "params": {"path": "echo", "input": {"n": 1}}}),
    )
    .await;
    let v = recv_json(&mut ws).await;
    assert_eq!(v["id"], "q1");
    assert_eq!(v["result"]["type"], "data");
    assert_eq!(v["result"]["data"]["input"]["n"], 1);
    assert_eq!(v["result"]["data"]["ctx"], "user-1");
}

#[tokio::test]
async fn subscription_lifecycle_with_stop() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(
        &mut ws,
        &json!({"id": "s1", "method": "subscription", "params": {"path": "onMessage"}}),
    )
    .await;

    let started = recv_json(&mut ws).await;
    assert_eq!(started["id"], "s1");
    assert_eq!(started["result"]["type"], "started");

    let first = recv_json(&mut ws).await;
    assert_eq!(first["id"], "s1");
    assert_eq!(first["result"]["type"], "data");
    assert_eq!(first["result"]["data"], "hello");

    let second = recv_json(&mut ws).await;
    assert_eq!(second["result"]["data"], "world");

    send_json(&mut ws, &json!({"id": "s1", "method": "stop"})).await;
    let stopped = recv_json(&mut ws).await;
    assert_eq!(stopped["id"], "s1");
    assert_eq!(stopped["result"]["type"], "stopped");

    // Mapping removed: a second stop is an idempotent no-op.
    send_json(&mut ws, &json!({"id": "s1", "method": "stop"})).await;
    let silence = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(silence.is_err());

    wait_for(|| harness.active_streams.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn subscription_completion_sends_stopped() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(
        &mut ws,
        &json!({"id": 7, "method": "subscription", "params": {"path": "finite"}}),
    )
    .await;

    assert_eq!(recv_json(&mut ws).await["result"]["type"], "started");
    assert_eq!(recv_json(&mut ws).await["result"]["data"], 1);
    assert_eq!(recv_json(&mut ws).await["result"]["data"], 2);
    let stopped = recv_json(&mut ws).await;
    assert_eq!(stopped["id"], 7);
    assert_eq!(stopped["result"]["type"], "stopped");

    wait_for(|| harness.active_streams.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn duplicate_subscription_id_rejected() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(
        &mut ws,
        &json!({"id": "dup", "method": "subscription", "params": {"path": "ticker"}}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["result"]["type"], "started");

    send_json(
        &mut ws,
        &json!({"id": "dup", "method": "subscription", "params": {"path": "ticker"}}),
    )
    .await;

    // The old subscription is cancelled, the new request fails; ticker data
    // may still be in flight, so scan for the rejection.
    let rejection = loop {
        let v = recv_json(&mut ws).await;
        if v.get("error").is_some() {
            break v;
        }
        assert_eq!(v["result"]["type"], "data");
    };
    assert_eq!(rejection["id"], "dup");
    assert_eq!(rejection["error"]["code"], "BAD_REQUEST");
    assert!(rejection["error"]["message"]
        .as_str()
        .unwrap()
        .contains("duplicate id"));

    // No second `started`, and every stream wound down.
    wait_for(|| harness.active_streams.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn batch_frame_dispatches_every_envelope() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(
        &mut ws,
        &json!([
            {"id": "a", "method": "query", "params": {"path": "echo", "input": 1}},
            {"id": "b", "method": "query", "params": {"path": "echo", "input": 2}}
        ]),
    )
    .await;

    let first = recv_json(&mut ws).await;
    let second = recv_json(&mut ws).await;
    let mut ids = vec![
        first["id"].as_str().unwrap().to_owned(),
        second["id"].as_str().unwrap().to_owned(),
    ];
    ids.sort();
    assert_eq!(ids, ["a", "b"]);
}

#[tokio::test]
async fn unparseable_frame_gets_null_id_parse_error() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    ws.send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    let v = recv_json(&mut ws).await;
    assert!(v["id"].is_null());
    assert_eq!(v["error"]["code"], "PARSE_ERROR");
}

#[tokio::test]
async fn missing_id_gets_bad_request() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(&mut ws, &json!({"method": "query", "params": {"path": "echo"}})).await;
    let v = recv_json(&mut ws).await;
    assert!(v["id"].is_null());
    assert_eq!(v["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn broadcast_reaches_every_open_connection() {
    let harness = boot().await;
    let mut ws1 = connect(&harness).await;
    let mut ws2 = connect(&harness).await;
    let ws3 = connect(&harness).await;

    wait_for_count(&harness, 3).await;
    drop(ws3);
    wait_for_count(&harness, 2).await;

    harness.server.broadcast_reconnect().await;

    let m1 = recv_json(&mut ws1).await;
    let m2 = recv_json(&mut ws2).await;
    assert_eq!(m1, m2);
    assert!(m1["id"].is_null());
    assert_eq!(m1["method"], "reconnect");
}

async fn wait_for_count(harness: &Harness, expected: usize) {
    timeout(TICK, async {
        while harness.server.registry().count().await != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connection count not reached");
}

#[tokio::test]
async fn connection_close_cancels_subscriptions() {
    let harness = boot().await;
    let mut ws = connect(&harness).await;

    send_json(
        &mut ws,
        &json!({"id": "t1", "method": "subscription", "params": {"path": "ticker"}}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["result"]["type"], "started");
    assert_eq!(harness.active_streams.load(Ordering::SeqCst), 1);

    drop(ws);

    wait_for(|| harness.active_streams.load(Ordering::SeqCst) == 0).await;
    wait_for_count(&harness, 0).await;
}

#[tokio::test]
async fn context_failure_sends_error_then_closes() {
    let harness = boot().await;

    let mut request = format!("ws://{}/ws", harness.addr)
        .into_client_request()
        .unwrap();
    let _ = request
        .headers_mut()
        .insert("x-fail-ctx", "1".parse().unwrap());
    let (mut ws, _) = connect_async(request).await.unwrap();

    // One best-effort connection-scoped error...
    let v = recv_json(&mut ws).await;
    assert!(v["id"].is_null());
    assert_eq!(v["error"]["code"], "BAD_REQUEST");
    assert_eq!(v["error"]["message"], "context refused");

    // ...then the server closes after the grace delay.
    let end = timeout(TICK, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(end.is_ok());
}

#[tokio::test]
async fn requests_before_context_resolution_are_answered() {
    // The factory sleeps, so the first frame arrives while the context is
    // still pending and must queue rather than fail.
    let active_streams = Arc::new(AtomicUsize::new(0));
    let dispatcher: Arc<dyn Dispatcher<String>> = Arc::new(IntegrationDispatcher {
        active_streams,
    });
    let factory: Arc<dyn ContextFactory<String>> = Arc::new(|_info: RequestInfo| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok::<_, RelayError>("slow-ctx".to_string())
    });
    let server = Arc::new(RelayServer::new(
        ServerConfig::default(),
        dispatcher,
        factory,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    drop(tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    }));

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws.send(Message::Text(
        json!({"id": "q1", "method": "query", "params": {"path": "echo"}})
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let v = recv_json(&mut ws).await;
    assert_eq!(v["id"], "q1");
    assert_eq!(v["result"]["data"]["ctx"], "slow-ctx");
}

#[tokio::test]
async fn ws_rejected_over_connection_limit() {
    let active_streams = Arc::new(AtomicUsize::new(0));
    let dispatcher: Arc<dyn Dispatcher<String>> = Arc::new(IntegrationDispatcher {
        active_streams,
    });
    let factory: Arc<dyn ContextFactory<String>> =
        Arc::new(|_info: RequestInfo| async move { Ok::<_, RelayError>("ctx".to_string()) });
    let server = Arc::new(RelayServer::new(
        ServerConfig {
            max_connections: 1,
            ..ServerConfig::default()
        },
        dispatcher,
        factory,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    drop(tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    }));

    let (_ws1, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    timeout(TICK, async {
        while server.registry().count().await != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let err = connect_async(format!("ws://{addr}/ws")).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status(), 503);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn http_health_over_real_socket() {
    let harness = boot().await;
    let _ws = connect(&harness).await;
    wait_for_count(&harness, 1).await;

    let url = format!("http://{}/health", harness.addr);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
}

#[tokio::test]
async fn http_procedure_over_real_socket() {
    let harness = boot().await;

    let url = format!("http://{}/echo?input=%7B%22n%22%3A9%7D", harness.addr);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["type"], "data");
    assert_eq!(body["result"]["data"]["kind"], "query");
    assert_eq!(body["result"]["data"]["input"]["n"], 9);
    assert_eq!(body["result"]["data"]["ctx"], "user-1");

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/echo", harness.addr))
        .body(r#"{"m":"hi"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["result"]["data"]["kind"], "mutation");
    assert_eq!(body["result"]["data"]["input"]["m"], "hi");
}
