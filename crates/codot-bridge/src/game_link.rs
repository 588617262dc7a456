use crate::capture::EventCaptureBus;
use crate::error::BridgeError;
use codot_core::game_channel::{
    encode_frame, GameCommand, GameFrame, GameMessage, NdjsonFrameDecoder,
};
use codot_core::protocol::{CommandError, ErrorCode, MAX_FRAME_BYTES};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The controlled process as seen by command handlers.
pub trait ControlledProcess: Send + Sync {
    fn is_running(&self) -> bool;
    fn session_count(&self) -> usize;
    /// Queues `command` for every connected game session and returns how many
    /// accepted it.
    fn send(&self, command: GameCommand) -> Result<usize, CommandError>;
}

#[derive(Debug, Clone)]
pub struct GameLinkConfig {
    pub addr: SocketAddr,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub debug: bool,
}

impl GameLinkConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            write_timeout: Duration::from_secs(2),
            queue_capacity: 64,
            max_frame_bytes: MAX_FRAME_BYTES,
            debug: false,
        }
    }
}

/// NDJSON side channel the game connects to. Every connection is a game
/// session; its frames are decoded once and recorded on the capture bus.
pub struct GameLink {
    bus: Arc<EventCaptureBus>,
    config: GameLinkConfig,
    conn_counter: AtomicU64,
    sessions: RwLock<HashMap<u64, mpsc::Sender<GameFrame>>>,
}

impl GameLink {
    pub fn new(bus: Arc<EventCaptureBus>, config: GameLinkConfig) -> Self {
        Self {
            bus,
            config,
            conn_counter: AtomicU64::new(0),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn listen(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(SocketAddr, JoinHandle<()>), BridgeError> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|source| BridgeError::Bind {
                name: "game".to_string(),
                addr: self.config.addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(event = "game_link_start", addr = %local_addr);
        let handle = tokio::spawn(self.accept_loop(listener, shutdown));
        Ok((local_addr, handle))
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
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
                            let link = Arc::clone(&self);
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                link.handle_connection(stream, peer, shutdown).await;
                            });
                        }
                        Err(err) => {
                            warn!(event = "game_accept_error", error = %err);
                        }
                    }
                }
            }
        }
        info!(event = "game_link_stop");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let session_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel::<GameFrame>(self.config.queue_capacity.max(1));
        let write_timeout = self.config.write_timeout;
        let max_frame_bytes = self.config.max_frame_bytes;
        let writer_task = tokio::spawn(async move {
            writer_loop(session_id, writer, rx, write_timeout, max_frame_bytes).await;
        });

        self.sessions_mut().insert(session_id, tx);
        self.bus.open_game_session(session_id, &peer.to_string());
        info!(event = "game_connected", session_id, peer = %peer);

        let mut decoder = NdjsonFrameDecoder::<GameFrame>::new(max_frame_bytes);
        let mut buf = vec![0u8; 8 * 1024];
        let reason = loop {
            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break "shutdown";
                    }
                    continue;
                }
                read = reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => {
                    let report = decoder.finish();
                    self.record_frames(session_id, report.frames);
                    break "eof";
                }
                Ok(n) => n,
                Err(err) => {
                    warn!(event = "game_read_error", session_id, error = %err);
                    break "read_error";
                }
            };
            let report = decoder.push_chunk(&buf[..n]);
            for err in &report.errors {
                warn!(event = "game_decode_error", session_id, error = %err);
            }
            self.record_frames(session_id, report.frames);
        };

        self.sessions_mut().remove(&session_id);
        self.bus.close_game_session(session_id, reason);
        info!(event = "game_disconnected", session_id, reason = reason);
        writer_task.abort();
        let _ = writer_task.await;
    }

    fn record_frames(&self, session_id: u64, frames: Vec<GameFrame>) {
        for frame in frames {
            if self.config.debug {
                debug!(event = "game_frame", session_id, topic = %frame.topic);
            }
            self.bus
                .record_game_message(session_id, GameMessage::decode(frame));
        }
    }

    fn sessions_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, mpsc::Sender<GameFrame>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn senders(&self) -> Vec<(u64, mpsc::Sender<GameFrame>)> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect()
    }
}

impl ControlledProcess for GameLink {
    fn is_running(&self) -> bool {
        self.session_count() > 0
    }

    fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn send(&self, command: GameCommand) -> Result<usize, CommandError> {
        let targets = self.senders();
        if targets.is_empty() {
            return Err(CommandError::not_running());
        }
        let frame = command.into_frame();
        let mut delivered = 0;
        for (session_id, tx) in targets {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(event = "game_send_error", session_id, topic = %frame.topic, error = %err);
                }
            }
        }
        if delivered == 0 {
            return Err(CommandError::new(
                ErrorCode::SendFailed,
                format!("no game session accepted '{}'", frame.topic),
            ));
        }
        Ok(delivered)
    }
}

async fn writer_loop(
    session_id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<GameFrame>,
    write_timeout: Duration,
    max_frame_bytes: usize,
) {
    while let Some(frame) = rx.recv().await {
        let encoded = match encode_frame(&frame, max_frame_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "game_encode_error", session_id, error = %err);
                continue;
            }
        };
        let send = async {
            writer.write_all(&encoded).await?;
            writer.flush().await
        };
        match tokio::time::timeout(write_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(event = "game_write_error", session_id, error = %err);
                break;
            }
            Err(_) => {
                warn!(event = "game_write_timeout", session_id);
                break;
            }
        }
    }
}
