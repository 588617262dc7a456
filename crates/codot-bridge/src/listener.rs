use crate::dispatch::Dispatcher;
use crate::error::BridgeError;
use crate::registry::{SessionId, SessionRegistry};
use crate::wait::cancelled;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    pub addr: SocketAddr,
    pub handshake_timeout: Duration,
    pub ping_interval: Option<Duration>,
    pub write_timeout: Duration,
    pub stale_after: Option<Duration>,
    pub queue_capacity: usize,
    pub debug: bool,
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            handshake_timeout: Duration::from_secs(5),
            ping_interval: Some(Duration::from_secs(10)),
            write_timeout: Duration::from_secs(2),
            stale_after: Some(Duration::from_secs(60)),
            queue_capacity: 256,
            debug: false,
        }
    }
}

/// One WebSocket endpoint. Each accepted socket gets its own handshake task,
/// writer task and keepalive task; frames are handed to the dispatcher.
pub struct BridgeListener {
    name: String,
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeListener {
    pub async fn listen(
        config: ListenerConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self, BridgeError> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| BridgeError::Bind {
                name: config.name.clone(),
                addr: config.addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let registry = Arc::clone(dispatcher.registry());
        let (shutdown, shutdown_rx) = watch::channel(false);
        Arc::clone(&registry).spawn_stale_reaper(config.stale_after, shutdown_rx.clone());

        info!(
            event = "listener_start",
            listener = %config.name,
            addr = %local_addr,
            commands = dispatcher.commands().len()
        );
        let name = config.name.clone();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::new(config),
            dispatcher,
            shutdown_rx,
        ));

        Ok(Self {
            name,
            local_addr,
            registry,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Stops accepting and closes every pending and open session. Safe to call
    /// more than once.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        let closed = self.registry.close_all("shutdown").await;
        info!(event = "listener_stop", listener = %self.name, closed_sessions = closed);
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<ListenerConfig>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, peer)) => {
                        let config = Arc::clone(&config);
                        let dispatcher = Arc::clone(&dispatcher);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, config, dispatcher, shutdown).await;
                        });
                    }
                    Err(err) => {
                        warn!(event = "accept_error", listener = %config.name, error = %err);
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ListenerConfig>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let registry = Arc::clone(dispatcher.registry());
    let session_id = registry.register(peer).await;
    if !peer.ip().is_loopback() {
        warn!(event = "peer_forbidden", listener = %config.name, peer = %peer);
        let _ = registry.disconnected(session_id, "forbidden").await;
        return;
    }

    let handshake = tokio::time::timeout(config.handshake_timeout, accept_async(stream));
    let ws = tokio::select! {
        _ = shutdown.changed() => {
            let _ = registry.disconnected(session_id, "shutdown").await;
            return;
        }
        result = handshake => match result {
            Ok(Ok(ws)) => ws,
            Ok(Err(err)) => {
                warn!(event = "handshake_failed", listener = %config.name, session_id, error = %err);
                let _ = registry.disconnected(session_id, "handshake_failed").await;
                return;
            }
            Err(_) => {
                warn!(event = "handshake_timeout", listener = %config.name, session_id, peer = %peer);
                let _ = registry.disconnected(session_id, "handshake_timeout").await;
                return;
            }
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(config.queue_capacity.max(1));
    let write_timeout = config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(event = "write_error", session_id, error = %err);
                    return;
                }
                Err(_) => {
                    warn!(event = "write_timeout", session_id);
                    return;
                }
            }
            if closing {
                return;
            }
        }
    });

    let mut closed = match registry.open(session_id, tx).await {
        Ok(closed) => closed,
        Err(err) => {
            warn!(event = "session_open_failed", listener = %config.name, error = %err);
            write_task.abort();
            return;
        }
    };
    let request_cancel = closed.clone();
    let keepalive = config
        .ping_interval
        .map(|interval| spawn_keepalive(Arc::clone(&registry), session_id, interval));

    let reason = loop {
        tokio::select! {
            _ = cancelled(&mut closed) => break None,
            next = ws_receiver.next() => {
                let msg = match next {
                    None => break Some("eof"),
                    Some(Err(err)) => {
                        debug!(event = "read_error", listener = %config.name, session_id, error = %err);
                        break Some("read_error");
                    }
                    Some(Ok(msg)) => msg,
                };
                registry.touch(session_id).await;
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break Some("client_close"),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                };
                if config.debug {
                    debug!(
                        event = "message_received",
                        listener = %config.name,
                        session_id,
                        raw = %String::from_utf8_lossy(&data)
                    );
                }
                dispatcher.dispatch(session_id, data, request_cancel.clone());
            }
        }
    };

    if let Some(reason) = reason {
        let _ = registry.disconnected(session_id, reason).await;
    }
    if let Some(keepalive) = keepalive {
        keepalive.abort();
    }
    if tokio::time::timeout(write_timeout, write_task).await.is_err() {
        debug!(event = "writer_drain_timeout", session_id);
    }
}

fn spawn_keepalive(
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            ticker.tick().await;
            if registry.ping(session_id).await.is_err() {
                debug!(event = "ping_stopped", listener = %registry.listener(), session_id);
                return;
            }
        }
    })
}
