use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use opencode_client_error::ClientError;

use crate::event_bus::EventObserver;
use crate::events::StreamEvent;
use crate::types::{Session, SessionStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedSession {
    pub id: String,
    /// Last session document seen, if any. Status-only entries have none.
    pub session: Option<Session>,
    pub status: SessionStatus,
    /// Whether a scope of this client is responsible for deleting it.
    pub owned: bool,
}

impl TrackedSession {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            session: None,
            status: SessionStatus::Idle,
            owned: false,
        }
    }
}

/// Client-side cache of sessions, their last known status and which of them
/// this client owns. Fed by API responses and by the event bus.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, TrackedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, session_id: &str) -> Option<SessionStatus> {
        self.lock()
            .get(session_id)
            .map(|tracked| tracked.status.clone())
    }

    pub fn cached_session(&self, session_id: &str) -> Option<Session> {
        self.lock()
            .get(session_id)
            .and_then(|tracked| tracked.session.clone())
    }

    pub fn is_owned(&self, session_id: &str) -> bool {
        self.lock()
            .get(session_id)
            .map_or(false, |tracked| tracked.owned)
    }

    pub fn owned_sessions(&self) -> Vec<String> {
        let mut owned: Vec<String> = self
            .lock()
            .values()
            .filter(|tracked| tracked.owned)
            .map(|tracked| tracked.id.clone())
            .collect();
        owned.sort();
        owned
    }

    pub fn tracked(&self) -> Vec<TrackedSession> {
        let mut tracked: Vec<TrackedSession> = self.lock().values().cloned().collect();
        tracked.sort_by(|a, b| a.id.cmp(&b.id));
        tracked
    }

    /// Stores `session` and returns it with the mirrored status applied.
    pub(crate) fn record_session(&self, mut session: Session) -> Session {
        let mut sessions = self.lock();
        let tracked = sessions
            .entry(session.id.clone())
            .or_insert_with(|| TrackedSession::new(&session.id));
        session.status = tracked.status.clone();
        tracked.session = Some(session.clone());
        session
    }

    pub(crate) fn record_status(&self, session_id: &str, status: SessionStatus) {
        let mut sessions = self.lock();
        let tracked = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| TrackedSession::new(session_id));
        if let Some(session) = tracked.session.as_mut() {
            session.status = status.clone();
        }
        tracked.status = status;
    }

    /// The server lists only sessions that are not idle; every other tracked
    /// session is idle.
    pub(crate) fn apply_statuses(&self, statuses: &HashMap<String, SessionStatus>) {
        let mut sessions = self.lock();
        for tracked in sessions.values_mut() {
            if !statuses.contains_key(&tracked.id) {
                tracked.status = SessionStatus::Idle;
                if let Some(session) = tracked.session.as_mut() {
                    session.status = SessionStatus::Idle;
                }
            }
        }
        drop(sessions);
        for (id, status) in statuses {
            self.record_status(id, status.clone());
        }
    }

    /// Marks `session_id` as owned by this client. Fails with `Conflict` if a
    /// scope already owns it.
    pub(crate) fn claim(&self, session: &Session) -> Result<(), ClientError> {
        let mut sessions = self.lock();
        let tracked = sessions
            .entry(session.id.clone())
            .or_insert_with(|| TrackedSession::new(&session.id));
        if tracked.owned {
            return Err(ClientError::Conflict {
                detail: format!("session {} is already owned by a scope", session.id),
            });
        }
        tracked.owned = true;
        let mut session = session.clone();
        session.status = tracked.status.clone();
        tracked.session = Some(session);
        Ok(())
    }

    pub(crate) fn disown(&self, session_id: &str) {
        if let Some(tracked) = self.lock().get_mut(session_id) {
            tracked.owned = false;
        }
    }

    pub(crate) fn forget(&self, session_id: &str) -> Option<TrackedSession> {
        self.lock().remove(session_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventObserver for SessionRegistry {
    fn observe(&self, event: &StreamEvent) {
        match event {
            StreamEvent::SessionCreated { session } | StreamEvent::SessionUpdated { session } => {
                self.record_session(session.clone());
            }
            StreamEvent::SessionDeleted { session_id } => {
                if let Some(tracked) = self.forget(session_id) {
                    if tracked.owned {
                        tracing::debug!(session_id = %session_id, "registry: owned session deleted remotely");
                    }
                }
            }
            StreamEvent::SessionStatus { session_id, status } => {
                self.record_status(session_id, status.clone());
            }
            StreamEvent::Complete { session_id } => {
                self.record_status(session_id, SessionStatus::Idle);
            }
            _ => {}
        }
    }
}
