use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opencode_client_error::ClientError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::classify::classify;
use crate::config::{ClientConfig, ConfigError};
use crate::event_bus::{EventBus, EventObserver, SessionFilter, Subscription};
use crate::events::StreamEvent;
use crate::registry::SessionRegistry;
use crate::retry::RetryPolicy;
use crate::scope::{ReleaseOutcome, SessionScope};
use crate::transport::{HttpTransport, Transport, TransportRequest, TransportResponse};
use crate::types::{
    CreateSessionRequest, HealthInfo, MessageWithParts, PermissionReply, PromptRequest, Session,
    SessionStatus,
};

const HEALTH_PATH: &str = "/global/health";
const SESSIONS_PATH: &str = "/session";
const SESSION_STATUS_PATH: &str = "/session/status";

/// Client for one OpenCode server. Cheap to clone; clones share the HTTP
/// pool, the event connection and the session registry.
#[derive(Clone)]
pub struct SessionClient {
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    retry: RetryPolicy,
    bus: EventBus,
    registry: Arc<SessionRegistry>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("base_url", &self.base_url())
            .field("event_bus", &self.inner.bus)
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let transport = HttpTransport::new(&config.base_url, config.request_timeout).map_err(
            |source| ConfigError::InvalidBaseUrl {
                url: config.base_url.clone(),
                source,
            },
        )?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let observer: Arc<dyn EventObserver> = registry.clone();
        let bus = EventBus::new(transport.clone(), config.stream.clone(), Some(observer));
        Self {
            inner: Arc::new(Inner {
                transport,
                retry: RetryPolicy::new(config.retry.clone()),
                config,
                bus,
                registry,
                shutdown: CancellationToken::new(),
            }),
            cancel: CancellationToken::new(),
        }
    }

    /// A clone whose operations return `Cancelled` once `token` fires.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            inner: self.inner.clone(),
            cancel: token,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn base_url(&self) -> &str {
        self.inner.transport.base_url()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// `Ok(false)` when the server cannot be reached or reports itself
    /// unhealthy. Fails only on an answer that is not a health document.
    pub async fn check_health(&self) -> Result<bool, ClientError> {
        match self.health().await {
            Ok(info) => Ok(info.healthy),
            Err(
                ClientError::ConnectionFailure { .. }
                | ClientError::Timeout { .. }
                | ClientError::ServerError { .. },
            ) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn health(&self) -> Result<HealthInfo, ClientError> {
        // Probes are answered now or not at all.
        let response = self
            .call("health", "server health", false, TransportRequest::get(HEALTH_PATH))
            .await?;
        decode("health", &response)
    }

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<Session, ClientError> {
        let mut transport_request =
            TransportRequest::post(SESSIONS_PATH).json(encode("create_session", &request)?);
        if let Some(directory) = &request.directory {
            transport_request = transport_request.query("directory", directory);
        }
        let response = self
            .call("create_session", "sessions", false, transport_request)
            .await?;
        let session: Session = decode("create_session", &response)?;
        tracing::info!(session_id = %session.id, title = %session.title, "session created");
        Ok(self.inner.registry.record_session(session))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, ClientError> {
        let response = self
            .call(
                "get_session",
                &session_resource(session_id),
                true,
                TransportRequest::get(session_path(session_id)),
            )
            .await?;
        let session: Session = decode("get_session", &response)?;
        Ok(self.inner.registry.record_session(session))
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        let response = self
            .call("list_sessions", "sessions", true, TransportRequest::get(SESSIONS_PATH))
            .await?;
        let sessions: Vec<Session> = decode("list_sessions", &response)?;
        Ok(sessions
            .into_iter()
            .map(|session| self.inner.registry.record_session(session))
            .collect())
    }

    /// Deleting a session the server no longer knows succeeds.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        self.guarded(self.delete_with(&self.cancel, session_id, true))
            .await
            .map(|_| ())
    }

    /// Blocking prompt: returns once the assistant reply is complete, bounded
    /// by the configured prompt timeout.
    pub async fn send_message(
        &self,
        session_id: &str,
        prompt: PromptRequest,
    ) -> Result<MessageWithParts, ClientError> {
        self.send_message_with_timeout(session_id, prompt, self.inner.config.prompt_timeout)
            .await
    }

    pub async fn send_message_with_timeout(
        &self,
        session_id: &str,
        prompt: PromptRequest,
        timeout: Duration,
    ) -> Result<MessageWithParts, ClientError> {
        let request = TransportRequest::post(format!("{}/message", session_path(session_id)))
            .json(encode("send_message", &prompt)?)
            .timeout(timeout);
        tracing::debug!(
            session_id = %session_id,
            timeout_ms = timeout.as_millis() as u64,
            "sending prompt"
        );
        let response = self
            .call("send_message", &session_resource(session_id), false, request)
            .await?;
        decode("send_message", &response)
    }

    /// Starts a turn and returns on acknowledgement. Progress arrives on the
    /// event stream.
    pub async fn prompt_non_blocking(
        &self,
        session_id: &str,
        prompt: PromptRequest,
    ) -> Result<(), ClientError> {
        let request = TransportRequest::post(format!("{}/prompt_async", session_path(session_id)))
            .json(encode("prompt_non_blocking", &prompt)?);
        self.call("prompt_non_blocking", &session_resource(session_id), false, request)
            .await?;
        self.inner
            .registry
            .record_status(session_id, SessionStatus::Busy);
        tracing::debug!(session_id = %session_id, "prompt accepted");
        Ok(())
    }

    /// Messages of a session, oldest first. `limit` keeps the newest ones.
    pub async fn list_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithParts>, ClientError> {
        let mut request = TransportRequest::get(format!("{}/message", session_path(session_id)));
        if let Some(limit) = limit {
            request = request.query("limit", limit.to_string());
        }
        let response = self
            .call("list_messages", &session_resource(session_id), true, request)
            .await?;
        decode("list_messages", &response)
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<(), ClientError> {
        let request = TransportRequest::post(format!("{}/abort", session_path(session_id)));
        self.call("abort_session", &session_resource(session_id), false, request)
            .await?;
        tracing::info!(session_id = %session_id, "session aborted");
        Ok(())
    }

    /// Status of every busy or retrying session. Sessions missing from the
    /// map are idle.
    pub async fn session_statuses(&self) -> Result<HashMap<String, SessionStatus>, ClientError> {
        let response = self
            .call(
                "session_statuses",
                "session status",
                true,
                TransportRequest::get(SESSION_STATUS_PATH),
            )
            .await?;
        let statuses: HashMap<String, SessionStatus> = decode("session_statuses", &response)?;
        self.inner.registry.apply_statuses(&statuses);
        Ok(statuses)
    }

    pub async fn reply_permission(
        &self,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), ClientError> {
        let request = TransportRequest::post(format!(
            "{}/permissions/{permission_id}",
            session_path(session_id)
        ))
        .json(json!({ "response": reply }));
        self.call(
            "reply_permission",
            &format!("permission {permission_id} of session {session_id}"),
            false,
            request,
        )
        .await?;
        Ok(())
    }

    pub fn subscribe_to_events(&self, filter: SessionFilter) -> Result<Subscription, ClientError> {
        self.inner.bus.subscribe(filter)
    }

    pub fn subscribe_with_capacity(
        &self,
        filter: SessionFilter,
        capacity: usize,
    ) -> Result<Subscription, ClientError> {
        self.inner.bus.subscribe_with_capacity(filter, capacity)
    }

    /// Waits until `session_id` is idle. Returns at once if it already is.
    /// To wait for a turn started by this caller, subscribe before prompting
    /// and use [`wait_for_turn_end`](Self::wait_for_turn_end).
    pub async fn wait_for_idle(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<StreamEvent, ClientError> {
        let mut subscription = self.subscribe_to_events(SessionFilter::session(session_id))?;
        if self.is_idle_now(session_id).await? {
            return Ok(StreamEvent::Complete {
                session_id: session_id.to_string(),
            });
        }
        self.wait_for_turn_end(&mut subscription, session_id, timeout)
            .await
    }

    /// Reads `subscription` until an event ends the current turn of
    /// `session_id` (`complete`, idle status or a session error) and returns
    /// that event. After a gap marker the server status is consulted.
    pub async fn wait_for_turn_end(
        &self,
        subscription: &mut Subscription,
        session_id: &str,
        timeout: Duration,
    ) -> Result<StreamEvent, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = self.inner.shutdown.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ClientError::Timeout {
                        operation: "wait_for_idle".to_string(),
                    })
                }
                next = subscription.recv() => next,
            };
            let Some(event) = next else {
                return Err(ClientError::StreamDisconnected {
                    reason: format!("event stream closed before session {session_id} went idle"),
                });
            };
            if event.ends_turn(session_id) {
                return Ok(event);
            }
            if event.is_marker() && self.is_idle_now(session_id).await? {
                tracing::debug!(session_id = %session_id, marker = event.kind().as_str(), "turn ended during stream gap");
                return Ok(StreamEvent::Complete {
                    session_id: session_id.to_string(),
                });
            }
        }
    }

    /// Creates a session owned by the returned scope.
    pub async fn create_session_scope(
        &self,
        request: CreateSessionRequest,
    ) -> Result<SessionScope, ClientError> {
        let session = self.create_session(request).await?;
        self.inner.registry.claim(&session)?;
        Ok(SessionScope::owned(self.clone(), session))
    }

    /// Takes ownership of an existing session. Fails with `Conflict` if a
    /// scope of this client already owns it.
    pub async fn adopt_session(&self, session_id: &str) -> Result<SessionScope, ClientError> {
        let session = self.get_session(session_id).await?;
        self.inner.registry.claim(&session)?;
        Ok(SessionScope::owned(self.clone(), session))
    }

    /// A scope that never deletes its session.
    pub async fn attach_session(&self, session_id: &str) -> Result<SessionScope, ClientError> {
        let session = self.get_session(session_id).await?;
        Ok(SessionScope::detached(self.clone(), session))
    }

    /// Runs `f` with a fresh owned session and releases it on every exit
    /// path. If the returned future is dropped early, the scope's drop guard
    /// deletes the session in the background.
    pub async fn with_session_scope<T, E, F, Fut>(
        &self,
        request: CreateSessionRequest,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(SessionScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ClientError>,
    {
        let scope = self.create_session_scope(request).await?;
        let result = f(scope.clone()).await;
        let outcome = scope.release().await;
        tracing::debug!(session_id = %scope.id(), outcome = ?outcome, "scoped session released");
        result
    }

    /// Closes the event connection and cancels in-flight operations of every
    /// clone.
    pub fn shutdown(&self) {
        tracing::info!(base_url = %self.base_url(), "client shutting down");
        self.inner.shutdown.cancel();
        self.inner.bus.shutdown();
    }

    /// Scope cleanup: one DELETE, never retried, outside caller
    /// cancellation.
    pub(crate) async fn release_owned(&self, session_id: &str) -> ReleaseOutcome {
        match self
            .delete_with(&CancellationToken::new(), session_id, false)
            .await
        {
            Ok(true) => ReleaseOutcome::Deleted,
            Ok(false) => ReleaseOutcome::AlreadyGone,
            Err(err) => {
                self.inner.registry.disown(session_id);
                tracing::warn!(
                    session_id = %session_id,
                    error = %err,
                    "scope release failed, session may remain on the server"
                );
                ReleaseOutcome::Failed(err)
            }
        }
    }

    /// `Ok(false)` when the session was already gone.
    async fn delete_with(
        &self,
        cancel: &CancellationToken,
        session_id: &str,
        retry: bool,
    ) -> Result<bool, ClientError> {
        let outcome = self
            .attempt(
                cancel,
                "delete_session",
                &session_resource(session_id),
                retry,
                TransportRequest::delete(session_path(session_id)),
            )
            .await;
        match outcome {
            Ok(_) => {
                self.inner.registry.forget(session_id);
                tracing::info!(session_id = %session_id, "session deleted");
                Ok(true)
            }
            Err(ClientError::NotFound { .. }) => {
                self.inner.registry.forget(session_id);
                tracing::debug!(session_id = %session_id, "session already gone");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn is_idle_now(&self, session_id: &str) -> Result<bool, ClientError> {
        let statuses = self.session_statuses().await?;
        Ok(statuses.get(session_id).map_or(true, SessionStatus::is_idle))
    }

    async fn call(
        &self,
        operation: &str,
        resource: &str,
        idempotent: bool,
        request: TransportRequest,
    ) -> Result<TransportResponse, ClientError> {
        self.guarded(self.attempt(&self.cancel, operation, resource, idempotent, request))
            .await
    }

    async fn guarded<T>(
        &self,
        operation: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, ClientError> {
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(ClientError::Cancelled),
            result = operation => result,
        }
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        operation: &str,
        resource: &str,
        idempotent: bool,
        request: TransportRequest,
    ) -> Result<TransportResponse, ClientError> {
        let transport = &self.inner.transport;
        let base_url = transport.base_url();
        self.inner
            .retry
            .execute(operation, idempotent, cancel, || {
                let request = request.clone();
                async move { classify(transport.send(request).await, base_url, operation, resource) }
            })
            .await
    }
}

fn session_path(session_id: &str) -> String {
    format!("{SESSIONS_PATH}/{session_id}")
}

fn session_resource(session_id: &str) -> String {
    format!("session {session_id}")
}

fn encode<T: Serialize>(operation: &str, value: &T) -> Result<Value, ClientError> {
    serde_json::to_value(value).map_err(|err| ClientError::BadRequest {
        status: 400,
        detail: format!("{operation}: request could not be encoded: {err}"),
    })
}

fn decode<T: DeserializeOwned>(
    operation: &str,
    response: &TransportResponse,
) -> Result<T, ClientError> {
    serde_json::from_slice(&response.body).map_err(|err| ClientError::InvalidResponse {
        operation: operation.to_string(),
        message: err.to_string(),
    })
}
