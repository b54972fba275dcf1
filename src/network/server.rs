//! WebSocket Session Server
//!
//! Async transport adapter around the deterministic session engine.
//! Accepts WebSocket connections on the room-derived endpoint, funnels
//! open/data/close events into one engine task, and fans engine
//! effects back out: sends to per-connection writer channels, typed
//! events and inputs to the host application.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::roster::{PlayerId, PlayerRoster};
use crate::session::engine::{Effect, SessionConfig, SessionEngine};
use crate::session::fairness::InputEvent;
use crate::session::registry::ConnId;
use crate::session::room::RoomId;

/// Transport adapter configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_host: IpAddr,
    /// Overrides the room-derived port (port 0 in tests).
    pub port_override: Option<u16>,
    /// Maximum concurrent transport connections.
    pub max_connections: usize,
    /// Session tunables handed to the engine.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port_override: None,
            max_connections: 32,
            session: SessionConfig::default(),
        }
    }
}

/// Hosting errors. Nothing here is fatal to the host process.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The derived endpoint could not be opened (e.g. address
    /// collision). Retryable with a freshly generated room code.
    #[error("failed to open listening endpoint {addr}: {source}")]
    Bind {
        /// Endpoint that failed to open.
        addr: SocketAddr,
        /// Underlying transport error.
        source: std::io::Error,
    },
}

/// Typed event emitted by the session layer to the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The set of players changed (join, leave, profile edit).
    PlayerSetChanged,

    /// A client-originated high-level command, uninterpreted.
    Command {
        /// Requesting player.
        player_id: PlayerId,
        /// Action name.
        action: String,
        /// Optional action data.
        payload: Option<Value>,
    },
}

/// Receiving half of the session layer's outputs.
pub struct SessionEvents {
    /// Player-set changes and relayed commands.
    pub events: mpsc::Receiver<SessionEvent>,
    /// The downstream input pipeline: all input, local and remote,
    /// after fairness delay.
    pub inputs: mpsc::Receiver<InputEvent>,
}

/// Commands funneled into the engine task.
enum EngineCommand {
    Open {
        conn: ConnId,
        writer: mpsc::Sender<ServerMessage>,
    },
    Message {
        conn: ConnId,
        msg: ClientMessage,
    },
    Closed {
        conn: ConnId,
    },
    SubmitInput {
        player_id: PlayerId,
        action: String,
        remote_origin: bool,
        payload: Option<Value>,
    },
    Broadcast {
        state: String,
        context: String,
        extra: serde_json::Map<String, Value>,
    },
}

/// Handle to one hosted session.
pub struct SessionServer {
    room: RoomId,
    local_addr: SocketAddr,
    cmd_tx: mpsc::Sender<EngineCommand>,
    lag_rx: watch::Receiver<u64>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SessionServer {
    /// Host a new session under a freshly generated room code.
    pub async fn host<R>(config: ServerConfig, roster: R) -> Result<(Self, SessionEvents), HostError>
    where
        R: PlayerRoster + Send + 'static,
    {
        Self::host_room(config, roster, RoomId::generate()).await
    }

    /// Host a session under a specific room identity.
    pub async fn host_room<R>(
        config: ServerConfig,
        roster: R,
        room: RoomId,
    ) -> Result<(Self, SessionEvents), HostError>
    where
        R: PlayerRoster + Send + 'static,
    {
        let port = config.port_override.unwrap_or_else(|| room.derive_port());
        let addr = SocketAddr::new(config.bind_host, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HostError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| HostError::Bind { addr, source })?;

        info!(code = %room.code(), %local_addr, "hosting session at /{}", room.address());

        let engine = SessionEngine::new(roster, config.session.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (inputs_tx, inputs_rx) = mpsc::channel(256);
        let (lag_tx, lag_rx) = watch::channel(0u64);
        let (shutdown_tx, _) = broadcast::channel(1);

        tokio::spawn(run_engine(
            engine,
            cmd_rx,
            events_tx,
            inputs_tx,
            lag_tx,
            shutdown_tx.subscribe(),
        ));

        tokio::spawn(run_accept(
            listener,
            room.address(),
            cmd_tx.clone(),
            shutdown_tx.clone(),
            config.max_connections,
        ));

        Ok((
            Self {
                room,
                local_addr,
                cmd_tx,
                lag_rx,
                shutdown_tx,
            },
            SessionEvents {
                events: events_rx,
                inputs: inputs_rx,
            },
        ))
    }

    /// Room identity of this session.
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Actual bound endpoint.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current fairness delay (ms), read-only.
    pub fn system_lag_ms(&self) -> u64 {
        *self.lag_rx.borrow()
    }

    /// Submit an input event into the fairness delay injector.
    ///
    /// `remote_origin` inputs dispatch immediately; local keyboard
    /// inputs are delayed by the current `system_lag`.
    pub async fn submit_input(
        &self,
        player_id: PlayerId,
        action: &str,
        remote_origin: bool,
        payload: Option<Value>,
    ) {
        let _ = self
            .cmd_tx
            .send(EngineCommand::SubmitInput {
                player_id,
                action: action.to_string(),
                remote_origin,
                payload,
            })
            .await;
    }

    /// Push a state change to every registered connection.
    pub async fn broadcast(
        &self,
        state: &str,
        context: &str,
        extra: serde_json::Map<String, Value>,
    ) {
        let _ = self
            .cmd_tx
            .send(EngineCommand::Broadcast {
                state: state.to_string(),
                context: context.to_string(),
                extra,
            })
            .await;
    }

    /// Stop the session: the accept loop, engine task and connection
    /// tasks all wind down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Wall clock in unix milliseconds, the engine's time base.
fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Accept loop: one task per inbound transport connection.
async fn run_accept(
    listener: TcpListener,
    address: String,
    cmd_tx: mpsc::Sender<EngineCommand>,
    shutdown_tx: broadcast::Sender<()>,
    max_connections: usize,
) {
    let active = Arc::new(AtomicUsize::new(0));
    let next_id = AtomicU64::new(1);
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    if active.load(Ordering::Relaxed) >= max_connections {
                        warn!(%peer, "connection limit reached, rejecting");
                        continue;
                    }
                    let conn = ConnId(next_id.fetch_add(1, Ordering::Relaxed));
                    debug!(%conn, %peer, "transport connection accepted");
                    active.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(handle_connection(
                        stream,
                        conn,
                        address.clone(),
                        cmd_tx.clone(),
                        shutdown_tx.subscribe(),
                        active.clone(),
                    ));
                }
                Err(e) => error!("accept error: {e}"),
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Per-connection task: WebSocket handshake on the room path, then a
/// read loop feeding the engine and a writer task draining its channel.
async fn handle_connection(
    stream: TcpStream,
    conn: ConnId,
    address: String,
    cmd_tx: mpsc::Sender<EngineCommand>,
    mut shutdown_rx: broadcast::Receiver<()>,
    active: Arc<AtomicUsize>,
) {
    let expected_path = format!("/{address}");
    let check_path = |req: &Request, resp: Response| {
        if req.uri().path() == expected_path {
            Ok(resp)
        } else {
            Err(ErrorResponse::new(Some("unknown room".to_string())))
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%conn, "websocket handshake failed: {e}");
            active.fetch_sub(1, Ordering::Relaxed);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(64);

    if cmd_tx
        .send(EngineCommand::Open { conn, writer: out_tx })
        .await
        .is_err()
    {
        active.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("failed to serialize message: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        // Writer channel dropped by the engine: close the socket.
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match ClientMessage::from_json(&text) {
                        Ok(parsed) => {
                            if cmd_tx.send(EngineCommand::Message { conn, msg: parsed }).await.is_err() {
                                break;
                            }
                        }
                        // Malformed traffic is an expected occurrence,
                        // never surfaced to the user.
                        Err(e) => debug!(%conn, "dropping malformed message: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%conn, "websocket error: {e}");
                    break;
                }
            },
            _ = shutdown_rx.recv() => break,
        }
    }

    let _ = cmd_tx.send(EngineCommand::Closed { conn }).await;
    writer_task.abort();
    active.fetch_sub(1, Ordering::Relaxed);
    debug!(%conn, "connection task finished");
}

/// The single engine task. Every state mutation happens here, one
/// command or timer turn at a time.
async fn run_engine<R: PlayerRoster>(
    mut engine: SessionEngine<R>,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
    events_tx: mpsc::Sender<SessionEvent>,
    inputs_tx: mpsc::Sender<InputEvent>,
    lag_tx: watch::Sender<u64>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut writers: BTreeMap<ConnId, mpsc::Sender<ServerMessage>> = BTreeMap::new();
    let mut heartbeat = interval(Duration::from_millis(engine.config().heartbeat_interval_ms));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let next_due = engine.next_input_due_ms();
        let until_due = next_due
            .map(|due| Duration::from_millis(due.saturating_sub(unix_now_ms())))
            .unwrap_or(Duration::ZERO);

        let effects: Vec<Effect> = tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => apply_command(&mut engine, cmd, &mut writers),
                None => break,
            },
            _ = heartbeat.tick() => engine.tick(unix_now_ms()),
            _ = tokio::time::sleep(until_due), if next_due.is_some() => {
                engine
                    .drain_inputs(unix_now_ms())
                    .into_iter()
                    .map(Effect::Input)
                    .collect()
            }
            _ = shutdown_rx.recv() => break,
        };

        dispatch_effects(effects, &mut writers, &events_tx, &inputs_tx).await;
        let _ = lag_tx.send(engine.system_lag_ms());
    }
}

/// Run one engine turn for a funneled command.
fn apply_command<R: PlayerRoster>(
    engine: &mut SessionEngine<R>,
    cmd: EngineCommand,
    writers: &mut BTreeMap<ConnId, mpsc::Sender<ServerMessage>>,
) -> Vec<Effect> {
    match cmd {
        EngineCommand::Open { conn, writer } => {
            writers.insert(conn, writer);
            engine.handle_open(conn, unix_now_ms())
        }
        EngineCommand::Message { conn, msg } => engine.handle_message(conn, msg, unix_now_ms()),
        EngineCommand::Closed { conn } => {
            writers.remove(&conn);
            engine.handle_close(conn, unix_now_ms());
            Vec::new()
        }
        EngineCommand::SubmitInput {
            player_id,
            action,
            remote_origin,
            payload,
        } => engine.submit_input(player_id, &action, remote_origin, payload, unix_now_ms()),
        EngineCommand::Broadcast {
            state,
            context,
            extra,
        } => engine.broadcast(&state, &context, extra),
    }
}

/// Fan engine effects out to their owners.
async fn dispatch_effects(
    effects: Vec<Effect>,
    writers: &mut BTreeMap<ConnId, mpsc::Sender<ServerMessage>>,
    events_tx: &mpsc::Sender<SessionEvent>,
    inputs_tx: &mpsc::Sender<InputEvent>,
) {
    for effect in effects {
        match effect {
            Effect::Send { conn, msg } => {
                if let Some(writer) = writers.get(&conn) {
                    // Best-effort: a dead channel just means the peer
                    // is already gone.
                    if writer.send(msg).await.is_err() {
                        debug!(%conn, "dropped send to closed connection");
                    }
                }
            }
            Effect::Close { conn } => {
                // Dropping the writer closes the socket task.
                writers.remove(&conn);
            }
            Effect::PlayerSetChanged => {
                let _ = events_tx.send(SessionEvent::PlayerSetChanged).await;
            }
            Effect::Command {
                player_id,
                action,
                payload,
            } => {
                let _ = events_tx
                    .send(SessionEvent::Command {
                        player_id,
                        action,
                        payload,
                    })
                    .await;
            }
            Effect::Input(input) => {
                let _ = inputs_tx.send(input).await;
            }
        }
    }
}
