//! Resumable transport sessions.
//!
//! A session survives link drops: the peer presents its resumption token on
//! reconnect and continues with its previous sequence numbering and state
//! blob. Sessions expire after 24 hours by default.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use pakt_core::constants::SESSION_LIFETIME_MS;
use pakt_core::types::TimestampMs;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub session_id: Uuid,
    pub resumption_token: Uuid,
    pub last_sequence: u64,
    pub expires_at_ms: TimestampMs,
    /// Opaque application state carried across reconnects.
    pub state_data: Vec<u8>,
}

impl Session {
    pub fn is_expired(&self, now_ms: TimestampMs) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh session.
    pub fn create(&self, now_ms: TimestampMs) -> Session {
        let session = Session {
            session_id: Uuid::new_v4(),
            resumption_token: Uuid::new_v4(),
            last_sequence: 0,
            expires_at_ms: now_ms + SESSION_LIFETIME_MS,
            state_data: Vec::new(),
        };
        self.sessions
            .lock()
            .expect("session table")
            .insert(session.session_id, session.clone());
        debug!(session = %session.session_id, "session created");
        session
    }

    /// Resume by token. Expired or unknown tokens yield `None`.
    pub fn resume(&self, token: Uuid, now_ms: TimestampMs) -> Option<Session> {
        let sessions = self.sessions.lock().expect("session table");
        sessions
            .values()
            .find(|s| s.resumption_token == token && !s.is_expired(now_ms))
            .cloned()
    }

    /// Record progress for a session.
    pub fn update(&self, session_id: Uuid, last_sequence: u64, state_data: Vec<u8>) {
        if let Some(s) = self
            .sessions
            .lock()
            .expect("session table")
            .get_mut(&session_id)
        {
            s.last_sequence = last_sequence;
            s.state_data = state_data;
        }
    }

    /// Drop expired sessions; returns how many were removed.
    pub fn sweep_expired(&self, now_ms: TimestampMs) -> usize {
        let mut sessions = self.sessions.lock().expect("session table");
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now_ms));
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session table").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
