use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ProtocolError;

pub type ConnectionId = u64;

/// Read-only view of one participant connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub alive: bool,
}

/// A finished upload handed from the session to the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub name: String,
    pub source: String,
    pub submitted_at: DateTime<Utc>,
}

/// Live connections and the set of names they hold.
#[derive(Debug, Default)]
pub struct Registry {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionInfo>,
    names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Claim `name` for a new connection.
    pub fn register_name(&mut self, name: &str) -> Result<ConnectionId, ProtocolError> {
        if !self.names.insert(name.to_string()) {
            return Err(ProtocolError::DuplicateName(name.to_string()));
        }
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                name: name.to_string(),
                source: None,
                submitted_at: None,
                alive: true,
            },
        );
        Ok(id)
    }

    /// Store an upload, replacing any earlier one. False if the connection is gone.
    pub fn record_submission(&mut self, id: ConnectionId, source: String, at: DateTime<Utc>) -> bool {
        match self.connections.get_mut(&id) {
            Some(conn) => {
                conn.source = Some(source);
                conn.submitted_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn mark_dead(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.alive = false;
        }
    }

    /// Drop a connection and release its name.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionInfo> {
        let conn = self.connections.remove(&id)?;
        self.names.remove(&conn.name);
        Some(conn)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&ConnectionInfo> {
        self.connections.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ConnectionInfo> {
        self.connections.values().find(|c| c.name == name)
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// All connections in registration order.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self.connections.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        all
    }

    /// Uploads of every connection that submitted, in registration order.
    pub fn submissions(&self) -> Vec<Submission> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| {
                Some(Submission {
                    source: c.source?,
                    submitted_at: c.submitted_at?,
                    name: c.name,
                })
            })
            .collect()
    }
}
