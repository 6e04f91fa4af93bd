//! Participant lobby over TCP.
//!
//! A session moves through three states, never backwards:
//! `Accepting` (clients connect with a name line and receive heartbeats),
//! `Collecting` (clients upload one program each) and `Closed` (the
//! submissions are handed to a match). Every connection is served by its own
//! tokio task; the host drives the transitions.

pub mod codes;
pub mod handler;
pub mod registry;

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::engine::server::Entrant;
use crate::metrics;

pub use codes::ControlCode;
pub use registry::{ConnectionId, ConnectionInfo, Registry, Submission};

/// Write half of a connection, shared by its handler, heartbeat and broadcasts.
pub(crate) type Writer = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Accepting,
    Collecting,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Accepting => "accepting",
            SessionState::Collecting => "collecting",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Errors that end a single connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("name already taken: {0}")]
    DuplicateName(String),
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
    #[error("failed to bind session listener: {0}")]
    Bind(#[source] std::io::Error),
}

/// Lifecycle events published on the session bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected { id: ConnectionId, name: String },
    Disconnected { id: ConnectionId, name: String },
    Submitted { id: ConnectionId, name: String, bytes: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub heartbeat: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            heartbeat: Duration::from_millis(500),
        }
    }
}

impl From<Submission> for Entrant {
    fn from(sub: Submission) -> Self {
        Entrant {
            name: sub.name,
            source: sub.source,
        }
    }
}

/// State shared by the accept loop and every connection task.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) writers: Mutex<HashMap<ConnectionId, Writer>>,
    pub(crate) state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Forget a connection whose write failed and announce it.
    pub(crate) fn connection_lost(&self, id: ConnectionId, reason: &str) {
        self.writers.lock().unwrap().remove(&id);
        let removed = self.registry.lock().unwrap().remove(id);
        if let Some(conn) = removed {
            metrics::LIVE_CONNECTIONS.dec();
            tracing::warn!(connection = id, name = %conn.name, "Connection lost: {reason}");
            self.emit(SessionEvent::Disconnected { id, name: conn.name });
        }
    }

    /// Forget a connection at session close. No event is fired.
    pub(crate) fn release(&self, id: ConnectionId) {
        self.writers.lock().unwrap().remove(&id);
        if self.registry.lock().unwrap().remove(id).is_some() {
            metrics::LIVE_CONNECTIONS.dec();
        }
    }

    pub(crate) fn submit(&self, id: ConnectionId, source: String) {
        let bytes = source.len();
        let name = {
            let mut reg = self.registry.lock().unwrap();
            if !reg.record_submission(id, source, Utc::now()) {
                return;
            }
            reg.get(id).map(|c| c.name.clone()).unwrap_or_default()
        };
        metrics::SUBMISSIONS_TOTAL.inc();
        tracing::info!(connection = id, name = %name, bytes, "Submission received");
        self.emit(SessionEvent::Submitted { id, name, bytes });
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    local_addr: SocketAddr,
}

impl Session {
    /// Bind the participant listener and start accepting connections.
    pub async fn bind(addr: impl ToSocketAddrs, config: SessionConfig) -> Result<Session, SessionError> {
        let listener = TcpListener::bind(addr).await.map_err(SessionError::Bind)?;
        let local_addr = listener.local_addr().map_err(SessionError::Bind)?;
        let (state_tx, _) = watch::channel(SessionState::Accepting);
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(SessionShared {
            config,
            registry: Mutex::new(Registry::new()),
            writers: Mutex::new(HashMap::new()),
            state_tx,
            events,
        });

        tokio::spawn(accept_loop(listener, shared.clone()));
        tracing::info!(addr = %local_addr, "Session accepting participants");

        Ok(Session { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Move the session forward. Backward and same-state moves are rejected.
    pub fn transition(&self, to: SessionState) -> Result<(), SessionError> {
        let mut result = Ok(());
        self.shared.state_tx.send_if_modified(|current| {
            if to > *current {
                tracing::info!(from = %current, to = %to, "Session state changed");
                *current = to;
                true
            } else {
                result = Err(SessionError::InvalidTransition { from: *current, to });
                false
            }
        });
        result
    }

    /// Close the session and return every submission made before closing.
    pub fn close(&self) -> Result<Vec<Submission>, SessionError> {
        // Hold the registry so no handler can drop its record in between.
        let reg = self.shared.registry.lock().unwrap();
        self.transition(SessionState::Closed)?;
        Ok(reg.submissions())
    }

    /// Write `code` to every registered connection. Returns how many writes succeeded.
    pub async fn broadcast(&self, code: ControlCode) -> usize {
        let targets: Vec<(ConnectionId, Writer)> = self
            .shared
            .writers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, w)| (*id, w.clone()))
            .collect();

        let results = join_all(targets.iter().map(|(id, writer)| async move {
            (*id, handler::write_code(writer, code).await)
        }))
        .await;

        let mut delivered = 0;
        for (id, res) in results {
            match res {
                Ok(()) => delivered += 1,
                Err(e) => self.shared.connection_lost(id, &e.to_string()),
            }
        }
        tracing::debug!(code = %code, delivered, "Broadcast sent");
        delivered
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.registry.lock().unwrap().snapshot()
    }

    pub fn connection(&self, name: &str) -> Option<ConnectionInfo> {
        self.shared.registry.lock().unwrap().by_name(name).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn on_connect<F>(&self, f: F) -> JoinHandle<()>
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        self.on_event(|e| matches!(e, SessionEvent::Connected { .. }), f)
    }

    pub fn on_disconnect<F>(&self, f: F) -> JoinHandle<()>
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        self.on_event(|e| matches!(e, SessionEvent::Disconnected { .. }), f)
    }

    pub fn on_submit<F>(&self, f: F) -> JoinHandle<()>
    where
        F: FnMut(SessionEvent) + Send + 'static,
    {
        self.on_event(|e| matches!(e, SessionEvent::Submitted { .. }), f)
    }

    fn on_event<P, F>(&self, filter: P, mut f: F) -> JoinHandle<()>
    where
        P: Fn(&SessionEvent) -> bool + Send + 'static,
        F: FnMut(SessionEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if filter(&event) => f(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Session subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<SessionShared>) {
    let mut state_rx = shared.state_tx.subscribe();
    loop {
        if *state_rx.borrow_and_update() != SessionState::Accepting {
            break;
        }
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "Accepted connection");
                    tokio::spawn(handler::handle_connection(shared.clone(), stream));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("Session stopped accepting participants");
}
