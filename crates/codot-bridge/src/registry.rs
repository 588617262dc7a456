use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn can_move_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("session {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: SessionId,
        from: SessionState,
        to: SessionState,
    },
}

struct SessionEntry {
    peer: SocketAddr,
    state: SessionState,
    outbound: Option<mpsc::Sender<Message>>,
    closed: watch::Sender<bool>,
    last_seen: Instant,
}

impl SessionEntry {
    fn transition(&mut self, id: SessionId, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_move_to(next) {
            return Err(SessionError::InvalidTransition {
                id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub peer: String,
    pub state: SessionState,
    pub idle_ms: u64,
}

/// Sessions of one listener. Ids start at 1 and are never reused, so any id
/// below the counter that is no longer tracked has been closed.
pub struct SessionRegistry {
    listener: String,
    next_id: AtomicU64,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new(listener: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            next_id: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn listener(&self) -> &str {
        &self.listener
    }

    pub async fn register(&self, peer: SocketAddr) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (closed, _) = watch::channel(false);
        self.sessions.write().await.insert(
            id,
            SessionEntry {
                peer,
                state: SessionState::Connecting,
                outbound: None,
                closed,
                last_seen: Instant::now(),
            },
        );
        debug!(event = "session_connecting", listener = %self.listener, session_id = id, peer = %peer);
        id
    }

    /// Completes the handshake. The returned receiver flips to `true` once the
    /// session is unregistered.
    pub async fn open(
        &self,
        id: SessionId,
        outbound: mpsc::Sender<Message>,
    ) -> Result<watch::Receiver<bool>, SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        entry.transition(id, SessionState::Open)?;
        entry.outbound = Some(outbound);
        entry.last_seen = Instant::now();
        info!(event = "session_open", listener = %self.listener, session_id = id, peer = %entry.peer);
        Ok(entry.closed.subscribe())
    }

    /// Explicit close: an open session passes through `Closing` and its
    /// writer is handed a close frame before the session is dropped.
    pub async fn unregister(&self, id: SessionId, reason: &str) -> Result<(), SessionError> {
        self.remove(id, reason, true).await
    }

    /// Transport ended underneath the session (EOF, read or write error).
    pub async fn disconnected(&self, id: SessionId, reason: &str) -> Result<(), SessionError> {
        self.remove(id, reason, false).await
    }

    async fn remove(&self, id: SessionId, reason: &str, graceful: bool) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        if let Some(outbound) = entry.outbound.take() {
            if graceful && entry.state == SessionState::Open && !outbound.is_closed() {
                entry.transition(id, SessionState::Closing)?;
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: reason.to_string().into(),
                };
                let _ = outbound.try_send(Message::Close(Some(frame)));
            }
        }
        entry.transition(id, SessionState::Closed)?;
        if let Some(entry) = sessions.remove(&id) {
            entry.closed.send_replace(true);
            info!(
                event = "session_closed",
                listener = %self.listener,
                session_id = id,
                peer = %entry.peer,
                reason = reason
            );
        }
        Ok(())
    }

    pub async fn state(&self, id: SessionId) -> Result<SessionState, SessionError> {
        if let Some(entry) = self.sessions.read().await.get(&id) {
            return Ok(entry.state);
        }
        if id >= 1 && id <= self.next_id.load(Ordering::SeqCst) {
            return Ok(SessionState::Closed);
        }
        Err(SessionError::NotFound(id))
    }

    async fn outbound(&self, id: SessionId) -> Result<mpsc::Sender<Message>, SessionError> {
        let sessions = self.sessions.read().await;
        match sessions.get(&id) {
            Some(entry) if entry.state == SessionState::Open => entry
                .outbound
                .clone()
                .ok_or(SessionError::NotFound(id)),
            _ => Err(SessionError::NotFound(id)),
        }
    }

    /// Queues one text frame for the session's writer task.
    pub async fn send(&self, id: SessionId, text: String) -> Result<(), SessionError> {
        let outbound = self.outbound(id).await?;
        if outbound.send(Message::Text(text)).await.is_err() {
            warn!(event = "send_error", listener = %self.listener, session_id = id);
            let _ = self.disconnected(id, "send_error").await;
            return Err(SessionError::NotFound(id));
        }
        Ok(())
    }

    pub async fn broadcast(&self, text: &str) -> usize {
        self.broadcast_except(None, text).await
    }

    pub async fn broadcast_except(&self, except: Option<SessionId>, text: &str) -> usize {
        let targets = self
            .open_ids()
            .await
            .into_iter()
            .filter(|id| Some(*id) != except)
            .collect::<Vec<_>>();
        let mut delivered = 0;
        for id in targets {
            if self.send(id, text.to_string()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Queues a ping frame. Fails once the writer has gone away.
    pub async fn ping(&self, id: SessionId) -> Result<(), SessionError> {
        let outbound = self.outbound(id).await?;
        outbound
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|_| SessionError::NotFound(id))
    }

    pub async fn touch(&self, id: SessionId) {
        if let Some(entry) = self.sessions.write().await.get_mut(&id) {
            entry.last_seen = Instant::now();
        }
    }

    pub async fn open_ids(&self) -> Vec<SessionId> {
        let mut ids = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.state == SessionState::Open)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub async fn open_count(&self) -> usize {
        self.open_ids().await.len()
    }

    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                peer: entry.peer.to_string(),
                state: entry.state,
                idle_ms: now.duration_since(entry.last_seen).as_millis() as u64,
            })
            .collect::<Vec<_>>();
        sessions.sort_by_key(|info| info.id);
        sessions
    }

    pub async fn close_all(&self, reason: &str) -> usize {
        let ids = self
            .sessions
            .read()
            .await
            .keys()
            .copied()
            .collect::<Vec<_>>();
        let mut closed = 0;
        for id in ids {
            if self.unregister(id, reason).await.is_ok() {
                closed += 1;
            }
        }
        closed
    }

    pub async fn reap_stale(&self, stale_after: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let expired = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| {
                entry.state == SessionState::Open
                    && now.duration_since(entry.last_seen) > stale_after
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for id in &expired {
            warn!(event = "stale_close", listener = %self.listener, session_id = *id);
            let _ = self.unregister(*id, "stale").await;
        }
        expired
    }

    pub fn spawn_stale_reaper(
        self: Arc<Self>,
        stale_after: Option<Duration>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(stale_after) = stale_after else {
            return;
        };
        let tick = std::cmp::max(Duration::from_millis(100), stale_after / 2);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.reap_stale(stale_after).await;
                    }
                }
            }
        });
    }
}
