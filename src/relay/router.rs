//! Session router
//!
//! Owns the session table: for each session id, at most one source and a
//! set of observers. All mutations go through a single mutex; every
//! operation is a handful of map lookups plus non-blocking queue pushes,
//! so the lock is never held across an await point.
//!
//! # Architecture
//!
//! ```text
//! SessionRouter
//!     |
//!     +-- connections: HashMap<ConnectionId, ConnectionHandle>
//!     +-- sessions:    HashMap<SessionId, Session { source, observers }>
//!     |
//!     +-- register()      -> handle + outbound queue (role unset)
//!     +-- bind()          -> role/session, evicts a previous source
//!     +-- unbind()        -> leaves the session, drops empty sessions
//!     +-- route_binary()  -> source -> every observer
//!     +-- route_command() -> observer -> source
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connection::{Binding, ConnectionHandle, ConnectionId, Outbound, SendFailure};
use super::protocol::{CloseReason, Role, StatusMessage};

/// Session identifier as supplied by clients
pub type SessionId = String;

/// Reasons the router refuses an operation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("connection is already bound")]
    AlreadyBound,

    #[error("connection is not registered")]
    NotRegistered,

    #[error("relay is shutting down")]
    ShuttingDown,
}

#[derive(Default)]
struct Session {
    source: Option<ConnectionHandle>,
    observers: HashMap<ConnectionId, ConnectionHandle>,
}

impl Session {
    fn is_empty(&self) -> bool {
        self.source.is_none() && self.observers.is_empty()
    }

    fn is_source(&self, id: ConnectionId) -> bool {
        self.source.as_ref().map(|s| s.id()) == Some(id)
    }

    fn notify_observers(&self, status: &StatusMessage) {
        let Some(text) = encode_status(status) else {
            return;
        };
        for observer in self.observers.values() {
            if let Err(e) = observer.try_send(Outbound::Text(text.clone())) {
                debug!("Status to observer {} not queued: {:?}", observer.id(), e);
            }
        }
    }
}

#[derive(Default)]
struct RouterState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    sessions: HashMap<SessionId, Session>,
}

/// Outcome of a binary fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Observers the frame was queued for
    pub delivered: usize,
    /// Observers whose queue was full
    pub dropped: usize,
}

/// Point-in-time view of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub source: Option<ConnectionId>,
    pub observers: Vec<ConnectionId>,
}

/// Router-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub sessions: usize,
    pub connections: usize,
}

/// Session registry and message router
pub struct SessionRouter {
    state: Mutex<RouterState>,
    shutdown: CancellationToken,
}

impl SessionRouter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a freshly accepted connection with no role
    ///
    /// Returns the handle shared with the router and the receiving end of
    /// its outbound queue.
    pub fn register(
        &self,
        queue_capacity: usize,
    ) -> Result<(ConnectionHandle, mpsc::Receiver<Outbound>), BindError> {
        if self.shutdown.is_cancelled() {
            return Err(BindError::ShuttingDown);
        }

        let (handle, rx) = ConnectionHandle::new(queue_capacity, self.shutdown.child_token());
        self.state
            .lock()
            .connections
            .insert(handle.id(), handle.clone());
        Ok((handle, rx))
    }

    /// Bind a registered connection to a role within a session
    ///
    /// A source replaces any previous source of the session; the previous
    /// connection is terminated and unbound before the new one takes the
    /// slot. Observers get the current source availability right away.
    pub fn bind(
        &self,
        handle: &ConnectionHandle,
        role: Role,
        session_id: &str,
    ) -> Result<(), BindError> {
        let mut state = self.state.lock();
        let id = handle.id();

        if !state.connections.contains_key(&id) {
            return Err(BindError::NotRegistered);
        }
        handle.bind(role, session_id)?;

        let created = !state.sessions.contains_key(session_id);
        let session = state.sessions.entry(session_id.to_string()).or_default();
        if created {
            debug!("Session {} created", session_id);
        }

        let evicted = match role {
            Role::Source => {
                let previous = session.source.replace(handle.clone());
                send_status(handle, &StatusMessage::identified());
                session.notify_observers(&StatusMessage::source_available(true));
                previous
            }
            Role::Observer => {
                session.observers.insert(id, handle.clone());
                send_status(
                    handle,
                    &StatusMessage::source_available(session.source.is_some()),
                );
                None
            }
        };

        if let Some(previous) = evicted {
            info!(
                "Session {}: source {} replaced by {}",
                session_id,
                previous.id(),
                id
            );
            previous.terminate(CloseReason::Replaced);
            state.connections.remove(&previous.id());
        }

        Ok(())
    }

    /// Remove a connection from the router
    ///
    /// Safe to call more than once and for connections that never bound.
    /// A departing source announces itself to the observers; a session
    /// left with neither source nor observers is dropped.
    pub fn unbind(&self, id: ConnectionId) {
        let mut state = self.state.lock();
        let Some(handle) = state.connections.remove(&id) else {
            return;
        };

        let binding = handle.binding();
        let Some(session_id) = binding.session_id() else {
            return;
        };
        let Some(session) = state.sessions.get_mut(session_id) else {
            return;
        };

        match binding {
            Binding::Source { .. } => {
                if session.is_source(id) {
                    session.source = None;
                    session.notify_observers(&StatusMessage::source_available(false));
                    info!("Session {}: source {} left", session_id, id);
                }
            }
            Binding::Observer { .. } => {
                session.observers.remove(&id);
            }
            Binding::Unidentified => {}
        }

        if session.is_empty() {
            state.sessions.remove(session_id);
            debug!("Session {} removed", session_id);
        }
    }

    /// Fan a binary frame from a source out to its session's observers
    ///
    /// Frames from anything but the session's current source are dropped,
    /// as are frames arriving while no observer is attached.
    pub fn route_binary(&self, from: ConnectionId, payload: Bytes) -> FanOut {
        let state = self.state.lock();
        let Some(session) = source_session(&state, from) else {
            return FanOut::default();
        };

        let mut fan_out = FanOut::default();
        for observer in session.observers.values() {
            match observer.try_send(Outbound::Frame(payload.clone())) {
                Ok(()) => fan_out.delivered += 1,
                Err(SendFailure::Full) => fan_out.dropped += 1,
                Err(SendFailure::Closed) => {}
            }
        }
        fan_out
    }

    /// Deliver an observer command to its session's source
    ///
    /// Returns `false` when the command was dropped.
    pub fn route_command(&self, from: ConnectionId, body: String) -> bool {
        let state = self.state.lock();
        let Some(handle) = state.connections.get(&from) else {
            return false;
        };
        let Binding::Observer { session_id } = handle.binding() else {
            return false;
        };
        let Some(source) = state
            .sessions
            .get(&session_id)
            .and_then(|session| session.source.as_ref())
        else {
            return false;
        };
        if !source.is_open() {
            return false;
        }

        match source.try_send(Outbound::Text(body)) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Session {}: command for source {} not queued: {:?}",
                    session_id,
                    source.id(),
                    e
                );
                false
            }
        }
    }

    /// Handles of every registered connection
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.state.lock().connections.values().cloned().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn session(&self, session_id: &str) -> Option<SessionSnapshot> {
        let state = self.state.lock();
        state.sessions.get(session_id).map(|session| SessionSnapshot {
            source: session.source.as_ref().map(|s| s.id()),
            observers: session.observers.keys().copied().collect(),
        })
    }

    pub fn stats(&self) -> RouterStats {
        let state = self.state.lock();
        RouterStats {
            sessions: state.sessions.len(),
            connections: state.connections.len(),
        }
    }

    /// Refuse new connections and terminate every registered one
    pub fn shutdown(&self) {
        info!(
            "Session router shutting down ({} connections)",
            self.connection_count()
        );
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for SessionRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// The session `id` currently occupies as source
fn source_session(state: &RouterState, id: ConnectionId) -> Option<&Session> {
    let handle = state.connections.get(&id)?;
    let Binding::Source { session_id } = handle.binding() else {
        return None;
    };
    state
        .sessions
        .get(&session_id)
        .filter(|session| session.is_source(id))
}

fn encode_status(status: &StatusMessage) -> Option<String> {
    match status.to_json() {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("Failed to serialize status message: {}", e);
            None
        }
    }
}

fn send_status(handle: &ConnectionHandle, status: &StatusMessage) {
    if let Some(text) = encode_status(status) {
        if let Err(e) = handle.try_send(Outbound::Text(text)) {
            debug!("Status to {} not queued: {:?}", handle.id(), e);
        }
    }
}
