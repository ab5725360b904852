//! Session registry
//!
//! One session per signaling connection. A session only records what it
//! owns; the records themselves live in the transport table and the media
//! graph.

use crate::types::{ConnectionId, ConsumerId, ProducerId, SessionId, TransportId, TransportRole};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub connection_id: ConnectionId,
    pub producing: Option<TransportId>,
    pub consuming: Option<TransportId>,
    pub producers: BTreeSet<ProducerId>,
    pub consumers: BTreeSet<ConsumerId>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(connection_id: ConnectionId) -> Self {
        Self {
            id: SessionId::random(),
            connection_id,
            producing: None,
            consuming: None,
            producers: BTreeSet::new(),
            consumers: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn transport(&self, role: TransportRole) -> Option<&TransportId> {
        match role {
            TransportRole::Producing => self.producing.as_ref(),
            TransportRole::Consuming => self.consuming.as_ref(),
        }
    }

    pub fn transport_slot(&mut self, role: TransportRole) -> &mut Option<TransportId> {
        match role {
            TransportRole::Producing => &mut self.producing,
            TransportRole::Consuming => &mut self.consuming,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            producing_transport: self.producing.clone(),
            consuming_transport: self.consuming.clone(),
            producers: self.producers.iter().cloned().collect(),
            consumers: self.consumers.iter().cloned().collect(),
            created_at: self.created_at,
        }
    }
}

/// Read-only view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub producing_transport: Option<TransportId>,
    pub consuming_transport: Option<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ConsumerId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    /// Returns the live session and whether it was just created
    pub fn get_or_create(&mut self, connection_id: &ConnectionId) -> (&mut Session, bool) {
        let mut created = false;
        let session = self
            .sessions
            .entry(connection_id.clone())
            .or_insert_with(|| {
                created = true;
                Session::new(connection_id.clone())
            });
        (session, created)
    }

    #[must_use]
    pub fn get(&self, connection_id: &ConnectionId) -> Option<&Session> {
        self.sessions.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &ConnectionId) -> Option<&mut Session> {
        self.sessions.get_mut(connection_id)
    }

    /// The session for `connection_id`, only if it is still the incarnation
    /// `session_id`
    pub fn current_mut(
        &mut self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Option<&mut Session> {
        self.sessions
            .get_mut(connection_id)
            .filter(|s| &s.id == session_id)
    }

    #[must_use]
    pub fn is_current(&self, connection_id: &ConnectionId, session_id: &SessionId) -> bool {
        self.sessions
            .get(connection_id)
            .is_some_and(|s| &s.id == session_id)
    }

    pub fn remove(&mut self, connection_id: &ConnectionId) -> Option<Session> {
        self.sessions.remove(connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_stable() {
        let mut registry = SessionRegistry::default();
        let conn = ConnectionId::from("conn-1");

        let (session, created) = registry.get_or_create(&conn);
        assert!(created);
        let id = session.id.clone();

        let (session, created) = registry.get_or_create(&conn);
        assert!(!created);
        assert_eq!(session.id, id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reused_identity_gets_fresh_session() {
        let mut registry = SessionRegistry::default();
        let conn = ConnectionId::from("conn-1");

        let old = registry.get_or_create(&conn).0.id.clone();
        registry.remove(&conn).unwrap();
        assert!(registry.remove(&conn).is_none());

        let new = registry.get_or_create(&conn).0.id.clone();
        assert_ne!(old, new);
        assert!(!registry.is_current(&conn, &old));
        assert!(registry.is_current(&conn, &new));
        assert!(registry.current_mut(&conn, &old).is_none());
    }

    #[test]
    fn test_transport_slots() {
        let mut registry = SessionRegistry::default();
        let conn = ConnectionId::from("conn-1");
        let (session, _) = registry.get_or_create(&conn);

        *session.transport_slot(TransportRole::Producing) = Some(TransportId::from("t-1"));
        assert_eq!(
            session.transport(TransportRole::Producing),
            Some(&TransportId::from("t-1"))
        );
        assert!(session.transport(TransportRole::Consuming).is_none());
    }
}
