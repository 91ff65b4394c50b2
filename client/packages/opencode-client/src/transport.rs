use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method};
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw body chunks of the long-lived event stream.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection refused, DNS resolution or TLS handshake failed.
    Connect,
    Timeout,
    /// The connection was established but reading the body failed.
    Body,
    Request,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?} error for {method} {path}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub method: String,
    pub path: String,
    pub message: String,
}

impl TransportError {
    pub fn new(
        kind: TransportErrorKind,
        method: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            method: method.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    fn from_reqwest(method: &Method, path: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TransportErrorKind::Timeout
        } else if err.is_connect() {
            TransportErrorKind::Connect
        } else if err.is_body() || err.is_decode() {
            TransportErrorKind::Body
        } else {
            TransportErrorKind::Request
        };
        Self::new(kind, method.as_str(), path, err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl TransportRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct StreamResponse {
    pub status: u16,
    pub stream: ByteStream,
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// HTTP seam between the session client and the server. Implementations pass
/// status codes through untouched and never retry.
pub trait Transport: Send + Sync + 'static {
    fn base_url(&self) -> &str;

    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>>;

    /// Open the long-lived event stream. The returned stream yields body
    /// chunks until the server closes the connection.
    fn open_stream(&self, path: &str) -> BoxFuture<'_, Result<StreamResponse, TransportError>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    base: Url,
    http_client: Client,
    stream_client: Client,
}

impl HttpTransport {
    /// `request_timeout` applies to request/response calls only; the stream
    /// client has a connect timeout but no total deadline.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, url::ParseError> {
        let base = Url::parse(base_url)?;
        let base_url = base.as_str().trim_end_matches('/').to_string();
        let http_client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        let stream_client = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self {
            base_url,
            base,
            http_client,
            stream_client,
        })
    }

    fn url_for(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url
    }
}

impl Transport for HttpTransport {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn send(
        &self,
        request: TransportRequest,
    ) -> BoxFuture<'_, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            let url = self.url_for(&request.path);

            let mut builder = self.http_client.request(request.method.clone(), url);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            for (key, value) in &request.headers {
                builder = builder.header(key.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            tracing::debug!(method = %request.method, path = %request.path, "transport: sending request");
            let response = builder
                .send()
                .await
                .map_err(|err| TransportError::from_reqwest(&request.method, &request.path, &err))?;
            let status = response.status().as_u16();
            let body = response
                .bytes()
                .await
                .map_err(|err| TransportError::from_reqwest(&request.method, &request.path, &err))?;
            tracing::debug!(
                method = %request.method,
                path = %request.path,
                status = status,
                bytes = body.len(),
                "transport: response received"
            );
            Ok(TransportResponse { status, body })
        })
    }

    fn open_stream(&self, path: &str) -> BoxFuture<'_, Result<StreamResponse, TransportError>> {
        let path = path.to_string();
        Box::pin(async move {
            let method = Method::GET;
            let url = self.url_for(&path);
            let response = self
                .stream_client
                .get(url)
                .header("accept", "text/event-stream")
                .send()
                .await
                .map_err(|err| TransportError::from_reqwest(&method, &path, &err))?;
            let status = response.status().as_u16();
            let stream_path = path.clone();
            let stream = response
                .bytes_stream()
                .map(move |chunk| {
                    chunk.map_err(|err| TransportError::from_reqwest(&Method::GET, &stream_path, &err))
                })
                .boxed();
            Ok(StreamResponse { status, stream })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_against_base() {
        let transport =
            HttpTransport::new("http://127.0.0.1:4096/", Duration::from_secs(1)).expect("transport");
        assert_eq!(transport.base_url(), "http://127.0.0.1:4096");
        assert_eq!(
            transport.url_for("/session/ses_1").as_str(),
            "http://127.0.0.1:4096/session/ses_1"
        );

        let prefixed =
            HttpTransport::new("http://localhost:8080/opencode", Duration::from_secs(1)).expect("transport");
        assert_eq!(
            prefixed.url_for("event").as_str(),
            "http://localhost:8080/opencode/event"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        assert!(HttpTransport::new("not a url", Duration::from_secs(1)).is_err());
    }
}
