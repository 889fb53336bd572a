//! Client integration tests: run a mock backend (axum WebSocket + REST routes)
//! and drive it through the real tokio-tungstenite / reqwest stack.
//!
//! Run with: `cargo test -p sdfx-link-client --test integration`

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use sdfx_link_client::rest::{ItemList, QueuePosition, RestError};
use sdfx_link_client::{ConnectionState, ReconnectPolicy, Session};
use sdfx_link_core::config::Endpoints;
use sdfx_link_core::events::{Event, EventData, EventKind};
use sdfx_link_core::identity::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
use sdfx_link_core::protocol::{ControlEnvelope, ImageFormat, preview_frame};
use sdfx_link_core::report::format_prompt_error;
use serde_json::{Value, json};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

const REST_TOKEN: &str = "rest-tok";

#[derive(Default)]
struct Backend {
    ws_client_ids: Vec<String>,
    auth_tokens: Vec<String>,
    posted: Vec<(String, Value)>,
}

type BackendState = Arc<Mutex<Backend>>;

/// Start the mock backend on a free port.
async fn start_backend() -> (BackendState, u16) {
    let state = BackendState::default();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/prompt", post(prompt))
        .route("/queue", get(queue).post(record_post))
        .route("/history", get(history).post(record_post))
        .route("/interrupt", post(record_post))
        .route("/object_info", get(object_info))
        .route("/customnode/getlist", get(custom_nodes))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (state, port)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<BackendState>,
) -> impl IntoResponse {
    let client_id = params.get("clientId").cloned().unwrap_or_default();
    let connection = {
        let mut backend = state.lock().unwrap();
        backend.ws_client_ids.push(client_id);
        backend.ws_client_ids.len()
    };
    ws.on_upgrade(move |socket| serve_socket(socket, state, connection))
}

/// The first connection gets a new session id and a preview. Every
/// connection records `auth`, answers `echo` and closes on `hangup`.
async fn serve_socket(mut socket: WebSocket, state: BackendState, connection: usize) {
    if connection == 1 {
        let status = json!({
            "type": "status",
            "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": "server-sid"},
        });
        socket.send(Message::Text(status.to_string().into())).await.ok();
        socket
            .send(Message::Binary(preview_frame(2, b"img")))
            .await
            .ok();
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let envelope: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
        match envelope["type"].as_str() {
            Some("auth") => {
                let token = envelope["data"]["token"].as_str().unwrap_or_default().to_string();
                state.lock().unwrap().auth_tokens.push(token);
            }
            Some("echo") => {
                let reply = json!({"type": "echoed", "data": envelope["data"]});
                socket.send(Message::Text(reply.to_string().into())).await.ok();
            }
            Some("hangup") => {
                socket.send(Message::Close(None)).await.ok();
                return;
            }
            _ => {}
        }
    }
}

async fn prompt(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let auth = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if auth != Some("Bearer rest-tok") {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"})));
    }
    if body["prompt"].is_null() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": {"type": "prompt_no_outputs", "message": "Prompt has no outputs", "details": ""},
                "node_errors": {},
            })),
        );
    }
    (
        StatusCode::OK,
        Json(json!({
            "prompt_id": "p1",
            "number": 3,
            "front": body.get("front").cloned().unwrap_or(Value::Bool(false)),
            "client_id": body["client_id"],
        })),
    )
}

async fn queue() -> Json<Value> {
    Json(json!({"queue_running": [[0, "p0", {}]], "queue_pending": []}))
}

async fn history(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    let max_items = params.get("max_items").cloned().unwrap_or_default();
    Json(json!({
        "zz-old": {"n": 1, "status": {"completed": true}, "max_items": max_items},
        "aa-new": {"n": 2, "status": {"completed": false}, "max_items": max_items},
    }))
}

async fn record_post(State(state): State<BackendState>, uri: Uri, body: String) -> StatusCode {
    let body = serde_json::from_str(&body).unwrap_or(Value::Null);
    state
        .lock()
        .unwrap()
        .posted
        .push((uri.path().to_string(), body));
    StatusCode::OK
}

async fn object_info() -> Json<Value> {
    Json(json!({"KSampler": {"category": "sampling"}}))
}

async fn custom_nodes() -> Json<Value> {
    Json(json!({"custom_nodes": [{"title": "Impact Pack"}], "chanel": "default"}))
}

fn endpoints(port: u16) -> Endpoints {
    Endpoints::from_host(&format!("http://127.0.0.1:{port}")).unwrap()
}

fn forward(session: &Session, kinds: &[EventKind]) -> UnboundedReceiver<Event> {
    let (tx, rx) = unbounded_channel();
    for kind in kinds {
        let tx = tx.clone();
        session.on(kind.clone(), move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
    }
    rx
}

async fn next(events: &mut UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Event channel closed")
}

#[tokio::test]
async fn test_ws_session_end_to_end() {
    let (backend, port) = start_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileIdentityStore::new(dir.path().join("client_id")));
    let session = Session::new(endpoints(port), store.clone()).with_policy(ReconnectPolicy {
        delay: Duration::from_millis(50),
        max_attempts: 5,
    });
    let echoed = EventKind::from("echoed");
    let mut events = forward(
        &session,
        &[
            EventKind::Status,
            EventKind::Preview,
            EventKind::Reconnecting,
            EventKind::Reconnected,
            echoed.clone(),
        ],
    );

    session.connect(Some("first-id".into()), Some("tok".into()));

    let status = next(&mut events).await;
    assert_eq!(status.kind, EventKind::Status);
    assert_eq!(status.data, EventData::Json(json!({"exec_info": {"queue_remaining": 0}})));
    assert_eq!(session.client_id(), "server-sid");
    assert_eq!(store.load().as_deref(), Some("server-sid"));

    let preview = next(&mut events).await;
    let image = preview.data.as_preview().expect("preview payload");
    assert_eq!(image.format, ImageFormat::Png);
    assert_eq!(&image.bytes[..], b"img");
    assert_eq!(session.state(), ConnectionState::Connected);

    session
        .send(ControlEnvelope::new("echo").with_data(json!({"n": 1})))
        .unwrap();
    let reply = next(&mut events).await;
    assert_eq!(reply.kind, echoed);
    assert_eq!(reply.data, EventData::Json(json!({"n": 1})));

    // Server hangs up: status(null), reconnecting, then a reopen under the new id.
    session.send(ControlEnvelope::new("hangup")).unwrap();
    let lost = next(&mut events).await;
    assert_eq!(lost.kind, EventKind::Status);
    assert_eq!(lost.data, EventData::Json(Value::Null));
    assert_eq!(next(&mut events).await.kind, EventKind::Reconnecting);
    assert_eq!(next(&mut events).await.kind, EventKind::Reconnected);

    session
        .send(ControlEnvelope::new("echo").with_data(json!({"n": 2})))
        .unwrap();
    assert_eq!(next(&mut events).await.data, EventData::Json(json!({"n": 2})));

    {
        let backend = backend.lock().unwrap();
        assert_eq!(backend.ws_client_ids, vec!["first-id", "server-sid"]);
        assert_eq!(backend.auth_tokens, vec!["tok", "tok"]);
    }

    session.disconnect();
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_backend_fails_after_cap() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let session = Session::new(endpoints(port), Arc::new(MemoryIdentityStore::new())).with_policy(
        ReconnectPolicy {
            delay: Duration::from_millis(10),
            max_attempts: 2,
        },
    );
    let mut attempts = forward(&session, &[EventKind::ConnectionAttempt]);

    session.connect(None, None);
    let mut state = session.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Failed),
    )
    .await
    .expect("Timed out waiting for Failed")
    .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = attempts.try_recv() {
        seen.push(event.data.as_json().and_then(Value::as_u64).unwrap());
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_rest_helpers() {
    let (backend, port) = start_backend().await;
    let session = Session::new(endpoints(port), Arc::new(MemoryIdentityStore::new()))
        .with_auth_token(Some(REST_TOKEN.into()));
    let rest = session.rest();

    let graph = json!({"3": {"class_type": "KSampler", "inputs": {}}});
    let queued = rest
        .queue_prompt(&session.client_id(), QueuePosition::Front, &graph, None)
        .await
        .unwrap();
    assert_eq!(queued["prompt_id"], "p1");
    assert_eq!(queued["front"], true);
    assert_eq!(queued["client_id"], session.client_id());

    let err = rest
        .queue_prompt("c", QueuePosition::Back, &Value::Null, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::Status { status: 400, .. }), "{err:?}");
    let report = format_prompt_error(&err.body_json().unwrap());
    assert_eq!(report, "Prompt has no outputs");

    let queue = rest.get_queue().await.unwrap();
    assert_eq!(queue.queue_running.len(), 1);
    assert!(queue.queue_pending.is_empty());

    let history = rest.get_history(10).await.unwrap();
    let order: Vec<&Value> = history.iter().map(|entry| &entry["n"]).collect();
    assert_eq!(order, vec![&json!(1), &json!(2)], "entries keep the server's order");
    assert_eq!(history[0]["max_items"], "10");

    rest.delete_item(ItemList::Queue, "p0").await.unwrap();
    rest.clear_items(ItemList::History).await.unwrap();
    rest.interrupt().await.unwrap();
    assert_eq!(
        backend.lock().unwrap().posted,
        vec![
            ("/queue".to_string(), json!({"delete": ["p0"]})),
            ("/history".to_string(), json!({"clear": true})),
            ("/interrupt".to_string(), Value::Null),
        ]
    );

    let defs = rest.get_node_defs().await.unwrap();
    assert_eq!(defs["KSampler"]["category"], "sampling");
    let nodes = rest.get_custom_nodes().await.unwrap();
    assert_eq!(nodes[0]["title"], "Impact Pack");

    // Missing route: status error, not a panic.
    let missing = rest.get_models().await.unwrap_err();
    assert!(matches!(missing, RestError::Status { status: 404, .. }), "{missing:?}");
}

#[tokio::test]
async fn test_rest_without_token_is_rejected() {
    let (_backend, port) = start_backend().await;
    let rest = Session::new(endpoints(port), Arc::new(MemoryIdentityStore::new())).rest();
    let err = rest
        .queue_prompt("c", QueuePosition::Back, &json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RestError::Status { status: 401, .. }), "{err:?}");
}
