#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::convert::Infallible;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use opencode_client::{BusState, ClientConfig, RetryConfig, SessionClient};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// In-process stand-in for an OpenCode server, bound to an ephemeral port.
pub struct MockServer {
    pub base_url: String,
    pub state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct MockState {
    sessions: Mutex<BTreeMap<String, Value>>,
    messages: Mutex<HashMap<String, Vec<Value>>>,
    busy: Mutex<HashSet<String>>,
    events: broadcast::Sender<Value>,
    next_id: AtomicU64,
    deletes: AtomicUsize,
    event_connections: AtomicUsize,
}

impl MockState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            sessions: Mutex::new(BTreeMap::new()),
            messages: Mutex::new(HashMap::new()),
            busy: Mutex::new(HashSet::new()),
            events,
            next_id: AtomicU64::new(1),
            deletes: AtomicUsize::new(0),
            event_connections: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: Value) {
        let _ = self.events.send(event);
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn event_connections(&self) -> usize {
        self.event_connections.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{:04}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn session_exists(&self, id: &str) -> bool {
        lock(&self.sessions).contains_key(id)
    }

    /// Appends a user message and the assistant reply, returning the reply.
    fn record_turn(&self, session_id: &str, text: &str) -> Value {
        let user_id = self.next_id("msg");
        let assistant_id = self.next_id("msg");
        let user = message(&user_id, session_id, "user", text, None);
        let reply_text = if text == "ping" { "pong".to_string() } else { format!("echo: {text}") };
        let assistant = message(&assistant_id, session_id, "assistant", &reply_text, Some(&user_id));
        let mut messages = lock(&self.messages);
        let history = messages.entry(session_id.to_string()).or_default();
        history.push(user);
        history.push(assistant.clone());
        assistant
    }
}

pub async fn spawn_mock_server() -> MockServer {
    let state = Arc::new(MockState::new());
    let app = Router::new()
        .route("/global/health", get(health))
        .route("/event", get(events))
        .route("/session", get(list_sessions).post(create_session))
        .route("/session/status", get(session_status))
        .route("/session/:id", get(get_session).delete(delete_session))
        .route("/session/:id/message", get(list_messages).post(send_message))
        .route("/session/:id/prompt_async", post(prompt_async))
        .route("/session/:id/abort", post(abort_session))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server");
    let addr = listener.local_addr().expect("mock addr");
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockServer {
        base_url: format!("http://{addr}"),
        state,
        task,
    }
}

/// Client with fast retries pointed at `base_url`.
pub fn test_client(base_url: &str) -> SessionClient {
    let config = ClientConfig::new(base_url)
        .with_request_timeout(Duration::from_secs(5))
        .with_prompt_timeout(Duration::from_secs(10))
        .with_retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_elapsed: Duration::from_secs(2),
        });
    SessionClient::new(config).expect("client")
}

pub async fn wait_for_connected(client: &SessionClient) {
    let started = Instant::now();
    while client.event_bus().state() != BusState::Connected {
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "event stream did not connect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn pick_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn message(id: &str, session_id: &str, role: &str, text: &str, parent: Option<&str>) -> Value {
    let mut info = json!({
        "id": id,
        "sessionID": session_id,
        "role": role,
        "time": {"created": now_ms()},
    });
    if role == "assistant" {
        info["time"]["completed"] = json!(now_ms());
        info["parentID"] = json!(parent);
    }
    json!({
        "info": info,
        "parts": [{
            "id": format!("prt_{id}"),
            "sessionID": session_id,
            "messageID": id,
            "type": "text",
            "text": text,
        }],
    })
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"name": "NotFoundError", "data": {"message": format!("Session not found: {id}")}})),
    )
        .into_response()
}

fn prompt_text(body: &Value) -> String {
    body["parts"]
        .as_array()
        .and_then(|parts| parts.iter().find_map(|part| part["text"].as_str()))
        .unwrap_or_default()
        .to_string()
}

async fn health() -> Json<Value> {
    Json(json!({"healthy": true, "version": "mock"}))
}

async fn events(
    State(state): State<Arc<MockState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    state.event_connections.fetch_add(1, Ordering::SeqCst);
    let receiver = state.events.subscribe();
    let connected = futures::stream::once(async {
        Ok(Event::default().data(json!({"type": "server.connected", "properties": {}}).to_string()))
    });
    let stream = BroadcastStream::new(receiver).filter_map(|item| async move {
        item.ok()
            .map(|value| Ok(Event::default().data(value.to_string())))
    });
    Sse::new(connected.chain(stream)).keep_alive(KeepAlive::default())
}

async fn list_sessions(State(state): State<Arc<MockState>>) -> Json<Value> {
    let sessions: Vec<Value> = lock(&state.sessions).values().cloned().collect();
    Json(Value::Array(sessions))
}

async fn create_session(
    State(state): State<Arc<MockState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let id = state.next_id("ses");
    let now = now_ms();
    let session = json!({
        "id": id,
        "slug": id,
        "projectID": "proj_mock",
        "directory": query.get("directory").cloned().unwrap_or_else(|| "/workspace".to_string()),
        "title": body["title"].as_str().unwrap_or("New session"),
        "version": "mock",
        "time": {"created": now, "updated": now},
    });
    lock(&state.sessions).insert(id.clone(), session.clone());
    state.emit(json!({"type": "session.created", "properties": {"info": session}}));
    Json(session)
}

async fn session_status(State(state): State<Arc<MockState>>) -> Json<Value> {
    let busy = lock(&state.busy);
    let statuses: serde_json::Map<String, Value> = busy
        .iter()
        .map(|id| (id.clone(), json!({"type": "busy"})))
        .collect();
    Json(Value::Object(statuses))
}

async fn get_session(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    match lock(&state.sessions).get(&id) {
        Some(session) => Json(session.clone()).into_response(),
        None => not_found(&id),
    }
}

async fn delete_session(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    state.deletes.fetch_add(1, Ordering::SeqCst);
    let removed = lock(&state.sessions).remove(&id);
    if removed.is_none() {
        return not_found(&id);
    }
    lock(&state.messages).remove(&id);
    state.emit(json!({"type": "session.deleted", "properties": {"info": {"id": id}}}));
    Json(json!(true)).into_response()
}

async fn list_messages(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !state.session_exists(&id) {
        return not_found(&id);
    }
    let history = lock(&state.messages).get(&id).cloned().unwrap_or_default();
    let limit = query
        .get("limit")
        .and_then(|limit| limit.parse::<usize>().ok())
        .unwrap_or(history.len());
    let start = history.len().saturating_sub(limit);
    Json(Value::Array(history[start..].to_vec())).into_response()
}

async fn send_message(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !state.session_exists(&id) {
        return not_found(&id);
    }
    Json(state.record_turn(&id, &prompt_text(&body))).into_response()
}

async fn prompt_async(
    State(state): State<Arc<MockState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !state.session_exists(&id) {
        return not_found(&id);
    }
    let text = prompt_text(&body);
    lock(&state.busy).insert(id.clone());
    tokio::spawn(async move {
        state.emit(json!({"type": "session.status", "properties": {"sessionID": id, "status": {"type": "busy"}}}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reply = state.record_turn(&id, &text);
        state.emit(json!({"type": "message.updated", "properties": {"info": reply["info"].clone()}}));
        state.emit(json!({
            "type": "message.part.updated",
            "properties": {"part": reply["parts"][0].clone(), "delta": reply["parts"][0]["text"].clone()},
        }));
        lock(&state.busy).remove(&id);
        state.emit(json!({"type": "session.status", "properties": {"sessionID": id, "status": {"type": "idle"}}}));
        state.emit(json!({"type": "session.idle", "properties": {"sessionID": id}}));
    });
    StatusCode::NO_CONTENT.into_response()
}

async fn abort_session(State(state): State<Arc<MockState>>, Path(id): Path<String>) -> Response {
    if !state.session_exists(&id) {
        return not_found(&id);
    }
    lock(&state.busy).remove(&id);
    Json(json!(true)).into_response()
}
