//! Connection handler
//!
//! One task per accepted WebSocket. The socket is split into a reader that
//! classifies inbound frames and hands them to the [`SessionRouter`], and a
//! writer that drains the connection's bounded outbound queue.
//!
//! ```text
//!            +-------------------- serve() ----------------------+
//! socket --> | read_loop: binary -> route_binary                 |
//!            |            text   -> decode -> bind/route_command |
//!            |            pong   -> mark_alive                   |
//!            |                                                   |
//! socket <-- | write_loop <- mpsc::Receiver<Outbound>            |
//!            +---------------------------------------------------+
//! ```
//!
//! Either half ending cancels the connection token; the reader then
//! unbinds from the router. Eviction and liveness timeouts go through the
//! same token, so there is a single cleanup path.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{self, CloseReason, ControlMessage, Role};
use super::router::{BindError, SessionRouter};
use crate::config::RelayConfig;
use crate::utils::LogThrottler;
use crate::{debug_throttled, warn_throttled};

/// Unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Role and session of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Unidentified,
    Source { session_id: String },
    Observer { session_id: String },
}

impl Binding {
    pub fn new(role: Role, session_id: String) -> Self {
        match role {
            Role::Source => Binding::Source { session_id },
            Role::Observer => Binding::Observer { session_id },
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Binding::Unidentified => None,
            Binding::Source { .. } => Some(Role::Source),
            Binding::Observer { .. } => Some(Role::Observer),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Binding::Unidentified => None,
            Binding::Source { session_id } | Binding::Observer { session_id } => Some(session_id),
        }
    }
}

/// Unit queued for the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Binary video frame
    Frame(Bytes),
    /// Serialized control message
    Text(String),
    /// Heartbeat probe
    Ping,
}

/// Why an outbound unit could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// Queue at capacity; the unit was dropped
    Full,
    /// Connection terminated
    Closed,
}

struct HandleInner {
    id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    binding: OnceLock<Binding>,
    close_reason: Mutex<Option<CloseReason>>,
    missed_probes: AtomicU32,
    connected_at: Instant,
}

/// Shared view of one connection, held by the router and the liveness
/// monitor. Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Create a handle with its outbound queue. `cancel` terminates the
    /// connection when cancelled.
    pub fn new(capacity: usize, cancel: CancellationToken) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: ConnectionId::new(),
                tx,
                cancel,
                binding: OnceLock::new(),
                close_reason: Mutex::new(None),
                missed_probes: AtomicU32::new(0),
                connected_at: Instant::now(),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn binding(&self) -> Binding {
        self.inner
            .binding
            .get()
            .cloned()
            .unwrap_or(Binding::Unidentified)
    }

    /// Set the binding. Fails if the connection is already bound.
    pub(crate) fn bind(&self, role: Role, session_id: &str) -> Result<(), BindError> {
        self.inner
            .binding
            .set(Binding::new(role, session_id.to_string()))
            .map_err(|_| BindError::AlreadyBound)
    }

    pub fn is_open(&self) -> bool {
        !self.inner.cancel.is_cancelled() && !self.inner.tx.is_closed()
    }

    /// Queue a unit without waiting
    pub fn try_send(&self, msg: Outbound) -> Result<(), SendFailure> {
        if self.inner.cancel.is_cancelled() {
            return Err(SendFailure::Closed);
        }
        self.inner.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFailure::Full,
            mpsc::error::TrySendError::Closed(_) => SendFailure::Closed,
        })
    }

    /// Terminate the connection. The first reason recorded wins.
    pub fn terminate(&self, reason: CloseReason) {
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.cancel.cancel();
    }

    /// Reason given to [`terminate`](Self::terminate), if any. A connection
    /// cancelled through its parent token reports `Shutdown`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        let reason = self.inner.close_reason.lock().clone();
        match reason {
            Some(reason) => Some(reason),
            None if self.inner.cancel.is_cancelled() => Some(CloseReason::Shutdown),
            None => None,
        }
    }

    /// Resolves once the connection is terminated
    pub async fn terminated(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Record that the peer proved it is alive
    pub fn mark_alive(&self) {
        self.inner.missed_probes.store(0, Ordering::Relaxed);
    }

    /// Record an outstanding probe, returning the number now unanswered
    pub fn record_probe(&self) -> u32 {
        self.inner.missed_probes.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn missed_probes(&self) -> u32 {
        self.inner.missed_probes.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        self.missed_probes() == 0
    }

    pub fn connected_secs(&self) -> u64 {
        self.inner.connected_at.elapsed().as_secs()
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("binding", &self.binding())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Drive one accepted WebSocket until it closes or is terminated
pub async fn serve(socket: WebSocket, router: Arc<SessionRouter>, config: RelayConfig) {
    let (handle, outbound_rx) = match router.register(config.outbound_queue_capacity) {
        Ok(registered) => registered,
        Err(e) => {
            debug!("Rejecting connection: {}", e);
            return;
        }
    };
    let id = handle.id();
    info!("Connection {} accepted (total: {})", id, router.connection_count());

    let (sender, receiver) = socket.split();

    tokio::join!(
        read_loop(receiver, &handle, &router),
        write_loop(sender, outbound_rx, &handle, config.send_timeout()),
    );

    info!(
        "Connection {} closed after {}s: {}",
        id,
        handle.connected_secs(),
        handle
            .close_reason()
            .unwrap_or(CloseReason::PeerClosed)
    );
}

async fn read_loop(
    mut receiver: SplitStream<WebSocket>,
    handle: &ConnectionHandle,
    router: &SessionRouter,
) {
    let throttler = LogThrottler::with_secs(5);

    loop {
        tokio::select! {
            biased;

            _ = handle.terminated() => break,

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        handle.mark_alive();
                        handle_binary(Bytes::from(data), handle, router, &throttler);
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle.mark_alive();
                        if let Err(reason) = handle_text(&text, handle, router, &throttler) {
                            warn!("Connection {}: {}", handle.id(), reason);
                            handle.terminate(reason);
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        // Pings are answered by the WebSocket layer
                        handle.mark_alive();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Connection {} sent close: {:?}", handle.id(), frame);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("Connection {} receive error: {}", handle.id(), e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    handle.terminate(CloseReason::PeerClosed);
    router.unbind(handle.id());
}

async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    handle: &ConnectionHandle,
    send_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            _ = handle.terminated() => {
                if let Some(frame) = handle.close_reason().and_then(|r| r.close_frame()) {
                    let _ = tokio::time::timeout(
                        send_timeout,
                        sender.send(Message::Close(Some(frame))),
                    )
                    .await;
                }
                break;
            }

            msg = outbound_rx.recv() => {
                let Some(msg) = msg else { break };
                let message = match msg {
                    Outbound::Frame(data) => Message::Binary(data.to_vec()),
                    Outbound::Text(text) => Message::Text(text),
                    Outbound::Ping => Message::Ping(Vec::new()),
                };

                match tokio::time::timeout(send_timeout, sender.send(message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!("Connection {} send failed: {}", handle.id(), e);
                        handle.terminate(CloseReason::TransportError);
                        break;
                    }
                    Err(_) => {
                        warn!(
                            "Connection {} send timed out after {:?}, terminating",
                            handle.id(),
                            send_timeout
                        );
                        handle.terminate(CloseReason::SlowConsumer);
                        break;
                    }
                }
            }
        }
    }
}

/// Binary frames are only meaningful from a bound source
fn handle_binary(
    data: Bytes,
    handle: &ConnectionHandle,
    router: &SessionRouter,
    throttler: &LogThrottler,
) {
    if handle.binding().role() != Some(Role::Source) {
        debug_throttled!(
            throttler,
            "binary_from_non_source",
            "Connection {}: dropping {} byte binary frame from non-source",
            handle.id(),
            data.len()
        );
        return;
    }

    let fan_out = router.route_binary(handle.id(), data);
    if fan_out.dropped > 0 {
        warn_throttled!(
            throttler,
            "observer_queue_full",
            "Connection {}: frame dropped for {} slow observer(s)",
            handle.id(),
            fan_out.dropped
        );
    }
}

/// Returns the close reason when the text frame is a fatal protocol violation
fn handle_text(
    text: &str,
    handle: &ConnectionHandle,
    router: &SessionRouter,
    throttler: &LogThrottler,
) -> Result<(), CloseReason> {
    let msg = match protocol::decode(text) {
        Ok(msg) => msg,
        Err(e) if e.is_fatal() => return Err(CloseReason::ProtocolError(e.to_string())),
        Err(e) => {
            debug_throttled!(
                throttler,
                "malformed_control",
                "Connection {}: ignoring text frame: {}",
                handle.id(),
                e
            );
            return Ok(());
        }
    };

    match msg {
        ControlMessage::Identify(request) => {
            let current = handle.binding();
            if current != Binding::Unidentified {
                info!(
                    "Connection {}: ignoring repeated identify, keeping {:?}",
                    handle.id(),
                    current
                );
                return Ok(());
            }

            let (role, session_id) = match request.validate() {
                Ok(identity) => identity,
                Err(e) if e.is_fatal() => {
                    return Err(CloseReason::ProtocolError(e.to_string()));
                }
                Err(e) => {
                    debug!("Connection {}: ignoring identify: {}", handle.id(), e);
                    return Ok(());
                }
            };

            match router.bind(handle, role, &session_id) {
                Ok(()) => {
                    info!(
                        "Connection {} identified as {} for session {}",
                        handle.id(),
                        role,
                        session_id
                    );
                }
                Err(e) => {
                    warn!("Connection {}: bind rejected: {}", handle.id(), e);
                }
            }
        }
        ControlMessage::Command { kind, body } => {
            if handle.binding().role() != Some(Role::Observer) {
                debug_throttled!(
                    throttler,
                    "command_from_non_observer",
                    "Connection {}: dropping {} from non-observer",
                    handle.id(),
                    kind.as_str()
                );
                return Ok(());
            }
            if !router.route_command(handle.id(), body) {
                debug_throttled!(
                    throttler,
                    "command_without_source",
                    "Connection {}: no source for {}, dropped",
                    handle.id(),
                    kind.as_str()
                );
            }
        }
        ControlMessage::Other { kind } => {
            debug_throttled!(
                throttler,
                "unknown_type",
                "Connection {}: ignoring message type {:?}",
                handle.id(),
                kind
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::ProtocolError;

    fn handle() -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        ConnectionHandle::new(4, CancellationToken::new())
    }

    #[test]
    fn test_binding_is_set_once() {
        let (handle, _rx) = handle();
        assert_eq!(handle.binding(), Binding::Unidentified);

        handle.bind(Role::Source, "X").unwrap();
        assert_eq!(
            handle.binding(),
            Binding::Source {
                session_id: "X".to_string()
            }
        );

        assert_eq!(handle.bind(Role::Observer, "Y"), Err(BindError::AlreadyBound));
        assert_eq!(handle.binding().role(), Some(Role::Source));
        assert_eq!(handle.binding().session_id(), Some("X"));
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let (handle, mut rx) = handle();
        for _ in 0..4 {
            handle.try_send(Outbound::Ping).unwrap();
        }
        assert_eq!(handle.try_send(Outbound::Ping), Err(SendFailure::Full));

        rx.try_recv().unwrap();
        assert!(handle.try_send(Outbound::Ping).is_ok());
    }

    #[test]
    fn test_terminate_keeps_first_reason() {
        let (handle, _rx) = handle();
        assert!(handle.is_open());
        assert_eq!(handle.close_reason(), None);

        handle.terminate(CloseReason::Replaced);
        handle.terminate(CloseReason::PeerClosed);

        assert!(!handle.is_open());
        assert_eq!(handle.close_reason(), Some(CloseReason::Replaced));
        assert_eq!(handle.try_send(Outbound::Ping), Err(SendFailure::Closed));
    }

    #[test]
    fn test_parent_cancel_reports_shutdown() {
        let parent = CancellationToken::new();
        let (handle, _rx) = ConnectionHandle::new(4, parent.child_token());

        parent.cancel();
        assert!(!handle.is_open());
        assert_eq!(handle.close_reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn test_probe_accounting() {
        let (handle, _rx) = handle();
        assert!(handle.is_alive());

        assert_eq!(handle.record_probe(), 1);
        assert_eq!(handle.record_probe(), 2);
        assert!(!handle.is_alive());

        handle.mark_alive();
        assert_eq!(handle.missed_probes(), 0);
    }

    #[tokio::test]
    async fn test_terminated_resolves() {
        let (handle, _rx) = handle();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.terminated().await });

        handle.terminate(CloseReason::HeartbeatTimeout);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_handle_text_rejects_invalid_identify() {
        let router = SessionRouter::new();
        let (handle, _rx) = router.register(4).unwrap();
        let throttler = LogThrottler::default();

        let result = handle_text(
            r#"{"type":"identify","sessionId":"X"}"#,
            &handle,
            &router,
            &throttler,
        );
        assert!(matches!(result, Err(CloseReason::ProtocolError(_))));

        let result = handle_text(
            r#"{"type":"identify","role":"spectator","sessionId":"X"}"#,
            &handle,
            &router,
            &throttler,
        );
        assert_eq!(
            result,
            Err(CloseReason::ProtocolError(
                ProtocolError::UnknownRole("spectator".into()).to_string()
            ))
        );
        assert_eq!(handle.binding(), Binding::Unidentified);

        // malformed and unknown frames are not fatal
        assert!(handle_text("{oops", &handle, &router, &throttler).is_ok());
        assert!(handle_text(r#"{"type":"hello"}"#, &handle, &router, &throttler).is_ok());
    }

    #[test]
    fn test_handle_text_ignores_reidentify() {
        let router = SessionRouter::new();
        let (handle, _rx) = router.register(4).unwrap();
        let throttler = LogThrottler::default();

        handle_text(
            r#"{"type":"identify","role":"observer","sessionId":"X"}"#,
            &handle,
            &router,
            &throttler,
        )
        .unwrap();

        // neither a valid nor an invalid second identify changes anything
        handle_text(
            r#"{"type":"identify","role":"source","sessionId":"Y"}"#,
            &handle,
            &router,
            &throttler,
        )
        .unwrap();
        handle_text(r#"{"type":"identify"}"#, &handle, &router, &throttler).unwrap();

        assert_eq!(
            handle.binding(),
            Binding::Observer {
                session_id: "X".to_string()
            }
        );
        assert!(router.session("Y").is_none());
    }

    #[test]
    fn test_handle_binary_from_observer_is_dropped() {
        let router = SessionRouter::new();
        let (source, mut source_rx) = router.register(4).unwrap();
        let (observer, mut observer_rx) = router.register(4).unwrap();
        let (other, mut other_rx) = router.register(4).unwrap();
        router.bind(&source, Role::Source, "X").unwrap();
        router.bind(&observer, Role::Observer, "X").unwrap();
        router.bind(&other, Role::Observer, "X").unwrap();
        while source_rx.try_recv().is_ok() {}
        while observer_rx.try_recv().is_ok() {}
        while other_rx.try_recv().is_ok() {}

        let throttler = LogThrottler::default();
        handle_binary(Bytes::from_static(b"frame"), &observer, &router, &throttler);

        assert!(source_rx.try_recv().is_err());
        assert!(observer_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_handle_text_command_from_source_is_dropped() {
        let router = SessionRouter::new();
        let (source, mut source_rx) = router.register(4).unwrap();
        let (observer, mut observer_rx) = router.register(4).unwrap();
        router.bind(&source, Role::Source, "X").unwrap();
        router.bind(&observer, Role::Observer, "X").unwrap();
        while source_rx.try_recv().is_ok() {}
        while observer_rx.try_recv().is_ok() {}

        let throttler = LogThrottler::default();
        handle_text(
            r#"{"type":"tap_relative","x":0.5,"y":0.5}"#,
            &source,
            &router,
            &throttler,
        )
        .unwrap();

        assert!(observer_rx.try_recv().is_err());
        assert!(source_rx.try_recv().is_err());
    }

    #[test]
    fn test_handle_text_command_reaches_source() {
        let router = SessionRouter::new();
        let (source, mut source_rx) = router.register(4).unwrap();
        let (observer, _observer_rx) = router.register(4).unwrap();
        router.bind(&source, Role::Source, "X").unwrap();
        router.bind(&observer, Role::Observer, "X").unwrap();
        while source_rx.try_recv().is_ok() {}

        let throttler = LogThrottler::default();
        handle_text(
            r#"{"type":"swipe_relative","x1":0.1,"y1":0.2,"x2":0.3,"y2":0.4}"#,
            &observer,
            &router,
            &throttler,
        )
        .unwrap();

        let Ok(Outbound::Text(body)) = source_rx.try_recv() else {
            panic!("expected forwarded command");
        };
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["type"], "swipe_relative");
        assert_eq!(value["x2"], 0.3);
    }
}
