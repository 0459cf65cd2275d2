// Integration tests for the WebSocket transport over a real socket: hello frame,
// frame handling, session binding and cleanup on close.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use statebridge_backend::api::{router, AppState};
use statebridge_backend::inference::EchoProvider;
use statebridge_backend::rate_limit::RateLimiter;
use statebridge_backend::session::SessionStore;
use statebridge_backend::snapshot::{Snapshot, Update};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (String, AppState) {
    let state = AppState {
        sessions: SessionStore::new(),
        provider: Arc::new(EchoProvider),
        rate_limiter: RateLimiter::per_minute(0),
        inference_timeout: Duration::from_secs(1),
    };
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{addr}/ws"), state)
}

async fn connect(url: &str, session_id: &str) -> Client {
    let (ws, _) = connect_async(format!("{url}?session_id={session_id}"))
        .await
        .unwrap();
    ws
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no frame within 2s")
            .expect("stream closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn test_hello_frames_and_cleanup_on_close() {
    let (url, state) = spawn_server().await;
    let mut ws = connect(&url, "ws-1").await;

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["session_id"], "ws-1");

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["kind"], "invalid_payload");

    let full = json!({"message_log": [{"role": "user", "text": "look around"}]});
    ws.send(Message::Text(full.to_string())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "response");
    assert_eq!(reply["response"]["text"], "Echo: look around");
    assert!(state.sessions.contains("ws-1"));

    ws.close(None).await.unwrap();
    let sessions = state.sessions.clone();
    eventually(move || !sessions.contains("ws-1")).await;
}

#[tokio::test]
async fn test_generated_session_id_when_none_given() {
    let (url, _state) = spawn_server().await;
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    let hello = next_json(&mut ws).await;
    let id = hello["session_id"].as_str().unwrap();
    assert_eq!(id.len(), 36);
}

#[tokio::test]
async fn test_second_socket_for_same_session_is_refused() {
    let (url, state) = spawn_server().await;
    let mut first = connect(&url, "shared").await;
    next_json(&mut first).await;

    let full = json!({"message_log": [{"role": "user", "text": "hi"}]});
    first.send(Message::Text(full.to_string())).await.unwrap();
    next_json(&mut first).await;

    match connect_async(format!("{url}?session_id=shared")).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 409),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second socket must be refused"),
    }

    // The refused attempt must not disturb the bound session
    let delta = json!({"updated": {"message_log": [{"role": "user", "text": "still here"}]}});
    first.send(Message::Text(delta.to_string())).await.unwrap();
    let reply = next_json(&mut first).await;
    assert_eq!(reply["response"]["text"], "Echo: still here");
    assert!(state.sessions.contains("shared"));
}

#[tokio::test]
async fn test_socket_close_keeps_session_it_did_not_create() {
    let (url, state) = spawn_server().await;
    let mut snapshot = Snapshot::default();
    snapshot.message_log = serde_json::from_value(json!([{"role": "user", "text": "from http"}]))
        .unwrap();
    state
        .sessions
        .reconcile("http-1", Update::Full(snapshot))
        .await
        .unwrap();

    let mut ws = connect(&url, "http-1").await;
    next_json(&mut ws).await;
    let delta = json!({"updated": {"message_log": [{"role": "user", "text": "from ws"}]}});
    ws.send(Message::Text(delta.to_string())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["response"]["text"], "Echo: from ws");
    ws.close(None).await.unwrap();

    // Reconnecting succeeds once the first socket's handler has finished
    let mut again = None;
    for _ in 0..100 {
        if let Ok((ws, _)) = connect_async(format!("{url}?session_id=http-1")).await {
            again = Some(ws);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut again = again.expect("session id was never released");
    next_json(&mut again).await;

    let snapshot = state.sessions.snapshot("http-1").await.unwrap();
    assert_eq!(snapshot.message_log[0].text, "from ws");
}
