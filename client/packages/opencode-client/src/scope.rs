use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opencode_client_error::ClientError;

use crate::client::SessionClient;
use crate::types::Session;

/// Result of releasing a [`SessionScope`].
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Deleted,
    /// The server no longer knew the session.
    AlreadyGone,
    AlreadyReleased,
    /// The scope does not own its session; nothing was deleted.
    Detached,
    /// The delete failed. The scope still counts as released.
    Failed(ClientError),
}

impl ReleaseOutcome {
    /// Everything except `Failed`.
    pub fn is_clean(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Handle to a session whose deletion happens exactly once: on the first
/// [`release`](Self::release), or when the last clone is dropped.
#[derive(Clone)]
pub struct SessionScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    session: Session,
    owner: bool,
    consumed: AtomicBool,
    client: SessionClient,
}

impl std::fmt::Debug for SessionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionScope")
            .field("session_id", &self.inner.session.id)
            .field("owner", &self.inner.owner)
            .field("released", &self.is_released())
            .finish()
    }
}

impl SessionScope {
    pub(crate) fn owned(client: SessionClient, session: Session) -> Self {
        Self::build(client, session, true)
    }

    pub(crate) fn detached(client: SessionClient, session: Session) -> Self {
        Self::build(client, session, false)
    }

    fn build(client: SessionClient, session: Session, owner: bool) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                session,
                owner,
                consumed: AtomicBool::new(false),
                client,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.session.id
    }

    /// Session document as of scope creation.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn is_owner(&self) -> bool {
        self.inner.owner
    }

    pub fn is_released(&self) -> bool {
        self.inner.consumed.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> &SessionClient {
        &self.inner.client
    }

    /// Deletes the session if this scope owns it and nobody released it yet.
    /// Concurrent callers race on one flag; only the winner talks to the
    /// server. The delete runs on its own task, so dropping this future
    /// does not abort it.
    pub async fn release(&self) -> ReleaseOutcome {
        if !self.inner.owner {
            return ReleaseOutcome::Detached;
        }
        if self.inner.consumed.swap(true, Ordering::SeqCst) {
            return ReleaseOutcome::AlreadyReleased;
        }
        let client = self.inner.client.clone();
        let session_id = self.inner.session.id.clone();
        let task = tokio::spawn(async move { client.release_owned(&session_id).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(session_id = %self.id(), error = %err, "scope: release task did not finish");
                self.inner.client.registry().disown(self.id());
                ReleaseOutcome::Failed(ClientError::Cancelled)
            }
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        if !self.owner || self.consumed.swap(true, Ordering::SeqCst) {
            return;
        }
        let session_id = self.session.id.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                session_id = %session_id,
                "scope: dropped outside a runtime, session left on the server"
            );
            return;
        };
        tracing::debug!(session_id = %session_id, "scope: dropped without release, deleting in background");
        let client = self.client.clone();
        runtime.spawn(async move {
            let outcome = client.release_owned(&session_id).await;
            tracing::debug!(session_id = %session_id, outcome = ?outcome, "scope: background release finished");
        });
    }
}
