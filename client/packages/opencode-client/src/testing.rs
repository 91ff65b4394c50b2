//! In-memory transport for exercising the client without a server. Request
//! handling is a closure; event streams are fed through [`StreamFeed`]s that
//! are handed out in the order connections are opened.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{
    BoxFuture, StreamResponse, Transport, TransportError, TransportErrorKind, TransportRequest,
    TransportResponse,
};

type Handler =
    dyn Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static;

type StreamItem = Result<Bytes, TransportError>;

pub struct ScriptedTransport {
    base_url: String,
    handler: Box<Handler>,
    requests: Mutex<Vec<TransportRequest>>,
    answered: Mutex<Vec<TransportRequest>>,
    delays: Mutex<HashMap<String, Duration>>,
    streams: Mutex<VecDeque<mpsc::UnboundedReceiver<StreamItem>>>,
    stream_opens: AtomicUsize,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("base_url", &self.base_url)
            .field("stream_opens", &self.stream_opens.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl ScriptedTransport {
    pub fn new<F>(base_url: impl Into<String>, handler: F) -> Arc<Self>
    where
        F: Fn(&TransportRequest) -> Result<TransportResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            base_url: base_url.into(),
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            answered: Mutex::new(Vec::new()),
            delays: Mutex::new(HashMap::new()),
            streams: Mutex::new(VecDeque::new()),
            stream_opens: AtomicUsize::new(0),
        })
    }

    /// Transport whose request handler refuses every call.
    pub fn stream_only(base_url: impl Into<String>) -> Arc<Self> {
        Self::new(base_url, |request| {
            Err(TransportError::new(
                TransportErrorKind::Connect,
                request.method.as_str(),
                &request.path,
                "no request handler",
            ))
        })
    }

    /// Queue the next event-stream connection and return its feed.
    pub fn push_stream(&self) -> StreamFeed {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.streams).push_back(receiver);
        StreamFeed { sender }
    }

    /// Hold every later `method` request for `delay` before answering it.
    pub fn delay(&self, method: &str, delay: Duration) {
        lock(&self.delays).insert(method.to_string(), delay);
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self, method: &str, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.method.as_str() == method && request.path == path)
            .count()
    }

    /// Requests that ran to completion. A request whose future was dropped
    /// during its delay is sent but never answered.
    pub fn answered_count(&self, method: &str, path: &str) -> usize {
        lock(&self.answered)
            .iter()
            .filter(|request| request.method.as_str() == method && request.path == path)
            .count()
    }

    pub fn stream_opens(&self) -> usize {
        self.stream_opens.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        lock(&self.requests).push(request.clone());
        let delay = lock(&self.delays).get(request.method.as_str()).copied();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let outcome = (self.handler)(&request);
            lock(&self.answered).push(request);
            outcome
        })
    }

    fn open_stream(&self, path: &str) -> BoxFuture<'_, Result<StreamResponse, TransportError>> {
        self.stream_opens.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.streams).pop_front();
        let path = path.to_string();
        Box::pin(async move {
            match next {
                Some(receiver) => Ok(StreamResponse {
                    status: 200,
                    stream: UnboundedReceiverStream::new(receiver).boxed(),
                }),
                None => Err(TransportError::new(
                    TransportErrorKind::Connect,
                    "GET",
                    path,
                    "connection refused",
                )),
            }
        })
    }
}

/// Writer side of one scripted event-stream connection. Dropping it ends the
/// stream as if the server closed the connection.
#[derive(Debug, Clone)]
pub struct StreamFeed {
    sender: mpsc::UnboundedSender<StreamItem>,
}

impl StreamFeed {
    pub fn send_raw(&self, bytes: impl Into<Bytes>) {
        let _ = self.sender.send(Ok(bytes.into()));
    }

    /// Send one JSON value framed as an SSE `data:` record.
    pub fn send_json(&self, value: &Value) {
        self.send_raw(format!("data: {value}\n\n"));
    }

    pub fn fail(&self, message: &str) {
        let _ = self.sender.send(Err(TransportError::new(
            TransportErrorKind::Body,
            "GET",
            "/event",
            message,
        )));
    }
}

pub fn json_response(status: u16, value: &Value) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status,
        body: Bytes::from(value.to_string()),
    })
}

pub fn empty_response(status: u16) -> Result<TransportResponse, TransportError> {
    Ok(TransportResponse {
        status,
        body: Bytes::new(),
    })
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
