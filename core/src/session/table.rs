// Session table — owns every live session, keyed by (request_id, direction)

use super::{Direction, Session};
use crate::SmError;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use tracing::debug;

pub type SessionKey = (u16, Direction);

#[derive(Debug)]
pub struct SessionTable {
    sessions: BTreeMap<SessionKey, Session>,
    max_sessions: usize,
    /// Last session stepped, for round-robin polling
    cursor: Option<SessionKey>,
}

impl SessionTable {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            max_sessions,
            cursor: None,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.sessions.contains_key(key)
    }

    pub fn get(&self, key: &SessionKey) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    /// Add a session, failing with a resource error when the table is full.
    pub fn insert(&mut self, session: Session) -> Result<&mut Session, SmError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SmError::SessionLimit {
                max: self.max_sessions,
            });
        }
        let key = session.key();
        debug!(request_id = key.0, direction = ?key.1, "Session created");
        Ok(self.sessions.entry(key).or_insert(session))
    }

    pub fn remove(&mut self, key: &SessionKey) -> Option<Session> {
        let removed = self.sessions.remove(key);
        if removed.is_some() {
            debug!(request_id = key.0, direction = ?key.1, "Session deleted");
        }
        removed
    }

    /// Whether any session (either direction) holds `request_id`
    pub fn in_use(&self, request_id: u16) -> bool {
        self.sessions.keys().any(|(id, _)| *id == request_id)
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions.keys().copied().collect()
    }

    /// Next session to step, round-robin over the table.
    pub fn next_key(&mut self) -> Option<SessionKey> {
        let next = match self.cursor {
            Some(cursor) => self
                .sessions
                .range((Excluded(cursor), Unbounded))
                .next()
                .map(|(k, _)| *k)
                .or_else(|| self.sessions.keys().next().copied()),
            None => self.sessions.keys().next().copied(),
        };
        self.cursor = next;
        next
    }
}
