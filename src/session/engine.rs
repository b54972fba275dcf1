//! Session Engine
//!
//! The deterministic core of the session layer. Owns the connection
//! registry, the roster seam and the fairness delay queue, and turns
//! transport events and timer ticks into explicit [`Effect`] values.
//! All state mutation happens inside these run-to-completion calls;
//! the engine performs no I/O and never reads the wall clock, so every
//! behavior is testable with a fake `now_ms`.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::roster::{PlayerId, PlayerKind, PlayerRoster};
use crate::session::fairness::{DelayQueue, InputEvent};
use crate::session::registry::{ConnId, ConnectionRegistry};

/// Tunables of one hosting session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat/ping timer period (ms).
    pub heartbeat_interval_ms: u64,
    /// No-activity threshold after which a connection is a zombie and
    /// a dangling player is forgotten (ms).
    pub liveness_threshold_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            liveness_threshold_ms: 30_000,
        }
    }
}

/// Side effect requested by an engine turn. The driver owns the actual
/// I/O: sends are best-effort, event variants go to the host
/// application, inputs go to the downstream input pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Send a message over a connection.
    Send {
        /// Target connection.
        conn: ConnId,
        /// Message to deliver.
        msg: ServerMessage,
    },

    /// Close a connection at the transport level.
    Close {
        /// Connection to close.
        conn: ConnId,
    },

    /// The set of players changed (join, leave, profile edit).
    PlayerSetChanged,

    /// A client-originated high-level command, relayed uninterpreted.
    Command {
        /// Requesting player.
        player_id: PlayerId,
        /// Action name.
        action: String,
        /// Optional action data.
        payload: Option<Value>,
    },

    /// An input event ready for the downstream pipeline.
    Input(InputEvent),
}

/// Session & fairness state machine for one hosting session.
pub struct SessionEngine<R: PlayerRoster> {
    config: SessionConfig,
    registry: ConnectionRegistry,
    roster: R,
    delay: DelayQueue,
    /// Remote players whose connection dropped, waiting out the grace
    /// window for a reconnect. Value is the disconnect time (ms).
    orphans: BTreeMap<PlayerId, u64>,
}

impl<R: PlayerRoster> SessionEngine<R> {
    /// Create an engine around a roster.
    pub fn new(roster: R, config: SessionConfig) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            roster,
            delay: DelayQueue::new(),
            orphans: BTreeMap::new(),
        }
    }

    /// A new transport connection opened. Starts the handshake.
    pub fn handle_open(&mut self, conn: ConnId, now_ms: u64) -> Vec<Effect> {
        self.registry.open(conn, now_ms);
        debug!(%conn, "connection opened, probing identity");
        vec![Effect::Send {
            conn,
            msg: ServerMessage::WhoAreYou,
        }]
    }

    /// An inbound message arrived on a connection.
    pub fn handle_message(&mut self, conn: ConnId, msg: ClientMessage, now_ms: u64) -> Vec<Effect> {
        if self.registry.get(conn).is_none() {
            // Raced with a close; nothing to do.
            return Vec::new();
        }

        match self.registry.player_of(conn) {
            None => match msg {
                ClientMessage::Hello { uuid } => self.handle_hello(conn, &uuid, now_ms),
                other => {
                    // Identity-before-trust boundary: nothing else is
                    // honored until the handshake completes.
                    debug!(%conn, ?other, "dropping message from unregistered connection");
                    Vec::new()
                }
            },
            Some(player_id) => {
                self.registry.touch(conn, now_ms);
                match msg {
                    ClientMessage::Hello { .. } => {
                        debug!(%conn, player_id, "duplicate HELLO on registered connection");
                        Vec::new()
                    }
                    ClientMessage::Pong { ts } => {
                        let rtt_ms = now_ms.saturating_sub(ts);
                        self.registry.record_rtt(conn, rtt_ms);
                        Vec::new()
                    }
                    ClientMessage::Input { action, payload } => {
                        self.submit_input(player_id, &action, true, payload, now_ms)
                    }
                    ClientMessage::UpdateProfile { payload } => {
                        if self.roster.update_by_id(player_id, &payload) {
                            vec![Effect::PlayerSetChanged]
                        } else {
                            Vec::new()
                        }
                    }
                    ClientMessage::Command { action, payload } => {
                        vec![Effect::Command {
                            player_id,
                            action,
                            payload,
                        }]
                    }
                }
            }
        }
    }

    /// The transport closed a connection. The connection is dropped
    /// immediately; a bound player dangles for the grace window so a
    /// quick reconnect resumes the same identity.
    pub fn handle_close(&mut self, conn: ConnId, now_ms: u64) {
        if let Some(entry) = self.registry.remove(conn) {
            if let Some(player_id) = entry.player {
                debug!(%conn, player_id, "connection closed, player awaiting reconnect");
                self.orphans.insert(player_id, now_ms);
            } else {
                debug!(%conn, "unregistered connection closed");
            }
        }
    }

    /// Periodic heartbeat turn: probe latency, reap zombies and
    /// forgotten players.
    pub fn tick(&mut self, now_ms: u64) -> Vec<Effect> {
        let mut effects = Vec::new();
        let threshold = self.config.liveness_threshold_ms;
        let mut changed = false;

        let mut zombies = Vec::new();
        for (conn, entry) in self.registry.registered() {
            if now_ms.saturating_sub(entry.last_heartbeat_ms) > threshold {
                zombies.push((conn, entry.player));
            } else {
                effects.push(Effect::Send {
                    conn,
                    msg: ServerMessage::Ping { ts: now_ms },
                });
            }
        }

        for (conn, player) in zombies {
            warn!(%conn, ?player, "reaping zombie connection");
            effects.push(Effect::Send {
                conn,
                msg: ServerMessage::Kick,
            });
            effects.push(Effect::Close { conn });
            self.registry.remove(conn);
            if let Some(player_id) = player {
                self.roster.remove_by_id(player_id);
                self.orphans.remove(&player_id);
                changed = true;
            }
        }

        let expired: Vec<PlayerId> = self
            .orphans
            .iter()
            .filter(|(_, since)| now_ms.saturating_sub(**since) > threshold)
            .map(|(id, _)| *id)
            .collect();
        for player_id in expired {
            info!(player_id, "reconnect window expired, removing player");
            self.orphans.remove(&player_id);
            self.roster.remove_by_id(player_id);
            changed = true;
        }

        if changed {
            effects.push(Effect::PlayerSetChanged);
        }
        effects
    }

    /// Single entry point for every input event, local or remote.
    ///
    /// Remote-origin input has already paid the network latency and is
    /// dispatched immediately; local input is held back by the current
    /// `system_lag` so both reach the pipeline with comparable delay.
    pub fn submit_input(
        &mut self,
        player_id: PlayerId,
        action: &str,
        remote_origin: bool,
        payload: Option<Value>,
        now_ms: u64,
    ) -> Vec<Effect> {
        let input = InputEvent {
            player_id,
            action: action.to_string(),
            payload,
        };

        if remote_origin {
            return vec![Effect::Input(input)];
        }

        let lag = self.registry.system_lag_ms();
        if lag == 0 {
            vec![Effect::Input(input)]
        } else {
            self.delay.schedule(now_ms + lag, input);
            Vec::new()
        }
    }

    /// Release fairness-delayed inputs whose due time has passed.
    pub fn drain_inputs(&mut self, now_ms: u64) -> Vec<InputEvent> {
        self.delay.drain_due(now_ms)
    }

    /// Earliest pending fairness dispatch, for the driver's timer.
    pub fn next_input_due_ms(&self) -> Option<u64> {
        self.delay.next_due_ms()
    }

    /// Push a state change to every registered connection, mirroring
    /// each player's own cosmetics. Connections whose player has
    /// vanished since the last tick are skipped.
    pub fn broadcast(
        &self,
        state: &str,
        context: &str,
        extra: serde_json::Map<String, Value>,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        for (conn, entry) in self.registry.registered() {
            let Some(player_id) = entry.player else {
                continue;
            };
            let Some(player) = self.roster.find_by_id(player_id) else {
                continue;
            };
            effects.push(Effect::Send {
                conn,
                msg: ServerMessage::StateChange {
                    state: state.to_string(),
                    context: context.to_string(),
                    player: player.profile.clone(),
                    extra: extra.clone(),
                },
            });
        }
        effects
    }

    /// Current fairness delay (ms). 0 when no phones are connected.
    pub fn system_lag_ms(&self) -> u64 {
        self.registry.system_lag_ms()
    }

    /// The roster seam.
    pub fn roster(&self) -> &R {
        &self.roster
    }

    /// Mutable roster access for the host application (lobby edits,
    /// explicit removals).
    pub fn roster_mut(&mut self) -> &mut R {
        &mut self.roster
    }

    /// The connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Session tunables.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Complete the handshake for a connection that sent `HELLO`.
    fn handle_hello(&mut self, conn: ConnId, uuid: &str, now_ms: u64) -> Vec<Effect> {
        let mut effects = Vec::new();

        // Local seats never handshake, so their synthetic uuids are not
        // a valid claim. Dropping the HELLO keeps a misbehaving phone
        // from binding to a keyboard player (and the reaper from later
        // deleting that seat when the phone goes silent).
        if let Some(player) = self.roster.find_by_uuid(uuid) {
            if player.kind == PlayerKind::Local {
                warn!(%conn, uuid, "dropping HELLO claiming a local player identity");
                return effects;
            }
        }

        let player_id = match self.roster.find_by_uuid(uuid).map(|p| p.id) {
            Some(player_id) => {
                // Reconnection: one connection per player, so any other
                // connection still bound to this id gets displaced.
                if let Some(stale) = self.registry.find_by_player(player_id) {
                    if stale != conn {
                        debug!(%stale, player_id, "evicting stale connection on reconnect");
                        effects.push(Effect::Send {
                            conn: stale,
                            msg: ServerMessage::Kick,
                        });
                        effects.push(Effect::Close { conn: stale });
                        self.registry.remove(stale);
                    }
                }
                self.orphans.remove(&player_id);
                info!(%conn, player_id, uuid, "player reconnected");
                player_id
            }
            None => match self.roster.create(PlayerKind::Remote, uuid) {
                Some(player) => {
                    info!(%conn, player_id = player.id, uuid, "new player joined");
                    player.id
                }
                None => {
                    warn!(%conn, uuid, "roster refused new player, ignoring HELLO");
                    return effects;
                }
            },
        };

        self.registry.bind(conn, player_id, now_ms);

        let Some(player) = self.roster.find_by_id(player_id) else {
            return effects;
        };
        effects.push(Effect::Send {
            conn,
            msg: ServerMessage::Init {
                player_id,
                profile: player.profile.clone(),
            },
        });
        effects.push(Effect::PlayerSetChanged);
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::{MemoryRoster, ProfilePatch};
    use serde_json::json;

    const THRESHOLD: u64 = 30_000;

    fn engine() -> SessionEngine<MemoryRoster> {
        SessionEngine::new(MemoryRoster::new(), SessionConfig::default())
    }

    /// Open a connection and complete the handshake, returning the
    /// bound player id.
    fn join(engine: &mut SessionEngine<MemoryRoster>, conn: ConnId, uuid: &str, now: u64) -> PlayerId {
        engine.handle_open(conn, now);
        engine.handle_message(
            conn,
            ClientMessage::Hello { uuid: uuid.to_string() },
            now,
        );
        engine.registry().player_of(conn).expect("handshake failed")
    }

    fn sends_to(effects: &[Effect], conn: ConnId) -> Vec<&ServerMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { conn: c, msg } if *c == conn => Some(msg),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_open_probes_identity() {
        let mut engine = engine();
        let effects = engine.handle_open(ConnId(1), 0);
        assert_eq!(
            effects,
            vec![Effect::Send { conn: ConnId(1), msg: ServerMessage::WhoAreYou }]
        );
    }

    #[test]
    fn test_handshake_creates_player_and_replies_init() {
        let mut engine = engine();
        engine.handle_open(ConnId(1), 0);
        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::Hello { uuid: "abc".to_string() },
            0,
        );

        let msgs = sends_to(&effects, ConnId(1));
        assert!(matches!(msgs[0], ServerMessage::Init { player_id: 0, .. }));
        assert!(effects.contains(&Effect::PlayerSetChanged));
        assert_eq!(engine.roster().list_active().len(), 1);
        assert_eq!(engine.registry().registered_count(), 1);
    }

    #[test]
    fn test_messages_before_hello_are_dropped() {
        let mut engine = engine();
        engine.handle_open(ConnId(1), 0);

        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::Input { action: "PRESS".to_string(), payload: None },
            0,
        );
        assert!(effects.is_empty());

        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::Command { action: "LEAVE".to_string(), payload: None },
            0,
        );
        assert!(effects.is_empty());

        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::UpdateProfile { payload: ProfilePatch::default() },
            0,
        );
        assert!(effects.is_empty());
        assert!(engine.roster().list_active().is_empty());
    }

    #[test]
    fn test_reconnect_within_window_resumes_same_player() {
        let mut engine = engine();
        let id = join(&mut engine, ConnId(1), "phone-a", 0);

        engine.handle_close(ConnId(1), 1_000);
        // Player dangles, unbound.
        assert_eq!(engine.roster().list_active().len(), 1);
        assert_eq!(engine.registry().registered_count(), 0);

        let resumed = join(&mut engine, ConnId(2), "phone-a", 5_000);
        assert_eq!(resumed, id);
        assert_eq!(engine.roster().list_active().len(), 1);

        // The grace window no longer applies after the reconnect.
        let effects = engine.tick(THRESHOLD + 2_000);
        assert!(!effects.contains(&Effect::PlayerSetChanged));
        assert_eq!(engine.roster().list_active().len(), 1);
    }

    #[test]
    fn test_duplicate_hello_evicts_first_connection() {
        let mut engine = engine();
        let id = join(&mut engine, ConnId(1), "flaky", 0);

        engine.handle_open(ConnId(2), 10);
        let effects = engine.handle_message(
            ConnId(2),
            ClientMessage::Hello { uuid: "flaky".to_string() },
            10,
        );

        // First connection is kicked and closed, not reaped.
        assert!(sends_to(&effects, ConnId(1))
            .iter()
            .any(|m| matches!(m, ServerMessage::Kick)));
        assert!(effects.contains(&Effect::Close { conn: ConnId(1) }));

        assert_eq!(engine.registry().player_of(ConnId(2)), Some(id));
        assert!(engine.registry().get(ConnId(1)).is_none());
        assert_eq!(engine.roster().list_active().len(), 1);
    }

    #[test]
    fn test_pong_updates_rtt_and_system_lag() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "a", 0);
        join(&mut engine, ConnId(2), "b", 0);

        engine.handle_message(ConnId(1), ClientMessage::Pong { ts: 60 }, 100);
        engine.handle_message(ConnId(2), ClientMessage::Pong { ts: 40 }, 100);

        assert_eq!(engine.registry().get(ConnId(1)).unwrap().rtt_ms, 40);
        assert_eq!(engine.registry().get(ConnId(2)).unwrap().rtt_ms, 60);
        // floor(mean(40, 60) / 2) = 25
        assert_eq!(engine.system_lag_ms(), 25);
    }

    #[test]
    fn test_tick_pings_registered_connections() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "a", 0);
        engine.handle_open(ConnId(2), 0); // never completes handshake

        let effects = engine.tick(1_000);
        assert_eq!(
            sends_to(&effects, ConnId(1)),
            vec![&ServerMessage::Ping { ts: 1_000 }]
        );
        assert!(sends_to(&effects, ConnId(2)).is_empty());
    }

    #[test]
    fn test_zombie_reaped_exactly_once() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "quiet", 0);

        // Inside the threshold: still pinged, not reaped.
        let effects = engine.tick(THRESHOLD);
        assert!(effects.iter().all(|e| !matches!(e, Effect::Close { .. })));

        let effects = engine.tick(THRESHOLD + 1);
        assert!(sends_to(&effects, ConnId(1))
            .iter()
            .any(|m| matches!(m, ServerMessage::Kick)));
        assert!(effects.contains(&Effect::Close { conn: ConnId(1) }));
        assert!(effects.contains(&Effect::PlayerSetChanged));
        assert!(engine.roster().list_active().is_empty());

        // Second tick finds nothing left to reap.
        let effects = engine.tick(THRESHOLD + 1_001);
        assert!(effects.is_empty());
    }

    #[test]
    fn test_any_traffic_refreshes_liveness() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "busy", 0);

        // A gameplay input counts as liveness, not just PONG.
        engine.handle_message(
            ConnId(1),
            ClientMessage::Input { action: "PRESS".to_string(), payload: None },
            20_000,
        );

        let effects = engine.tick(THRESHOLD + 1);
        assert!(!effects.contains(&Effect::Close { conn: ConnId(1) }));

        let effects = engine.tick(20_000 + THRESHOLD + 1);
        assert!(effects.contains(&Effect::Close { conn: ConnId(1) }));
    }

    #[test]
    fn test_dangling_player_reaped_after_grace_window() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "gone", 0);
        engine.handle_close(ConnId(1), 1_000);

        let effects = engine.tick(1_000 + THRESHOLD);
        assert!(!effects.contains(&Effect::PlayerSetChanged));
        assert_eq!(engine.roster().list_active().len(), 1);

        let effects = engine.tick(1_000 + THRESHOLD + 1);
        assert!(effects.contains(&Effect::PlayerSetChanged));
        assert!(engine.roster().list_active().is_empty());
    }

    #[test]
    fn test_remote_input_dispatches_immediately() {
        let mut engine = engine();
        let id = join(&mut engine, ConnId(1), "a", 0);
        engine.handle_message(ConnId(1), ClientMessage::Pong { ts: 0 }, 50);
        assert_eq!(engine.system_lag_ms(), 25);

        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::Input {
                action: "PRESS".to_string(),
                payload: Some(json!({"x": 1})),
            },
            100,
        );
        assert_eq!(
            effects,
            vec![Effect::Input(InputEvent {
                player_id: id,
                action: "PRESS".to_string(),
                payload: Some(json!({"x": 1})),
            })]
        );
        assert_eq!(engine.next_input_due_ms(), None);
    }

    #[test]
    fn test_local_input_is_delayed_by_system_lag() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "a", 0);
        join(&mut engine, ConnId(2), "b", 0);
        engine.handle_message(ConnId(1), ClientMessage::Pong { ts: 60 }, 100);
        engine.handle_message(ConnId(2), ClientMessage::Pong { ts: 40 }, 100);
        assert_eq!(engine.system_lag_ms(), 25);

        // Local PRESS at t=200 must not reach the pipeline before t=225.
        let effects = engine.submit_input(0, "PRESS", false, None, 200);
        assert!(effects.is_empty());
        assert_eq!(engine.next_input_due_ms(), Some(225));

        assert!(engine.drain_inputs(224).is_empty());
        let due = engine.drain_inputs(225);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].action, "PRESS");
        // Exactly once.
        assert!(engine.drain_inputs(10_000).is_empty());
    }

    #[test]
    fn test_local_input_immediate_without_remote_players() {
        let mut engine = SessionEngine::new(
            MemoryRoster::with_default_locals(),
            SessionConfig::default(),
        );
        assert_eq!(engine.system_lag_ms(), 0);

        let effects = engine.submit_input(0, "PRESS", false, None, 0);
        assert!(matches!(effects.as_slice(), [Effect::Input(_)]));
    }

    #[test]
    fn test_scheduled_dispatch_survives_player_removal() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "a", 0);
        engine.handle_message(ConnId(1), ClientMessage::Pong { ts: 0 }, 100);
        assert!(engine.system_lag_ms() > 0);

        engine.submit_input(0, "PRESS", false, None, 200);
        engine.roster_mut().remove_by_id(0);

        // Not cancellable: it still fires, the pipeline filters it.
        let due = engine.drain_inputs(10_000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].player_id, 0);
    }

    #[test]
    fn test_broadcast_mirrors_cosmetics_and_skips_vanished() {
        let mut engine = engine();
        join(&mut engine, ConnId(1), "a", 0);
        let removed = join(&mut engine, ConnId(2), "b", 0);
        engine.roster_mut().remove_by_id(removed);

        let mut extra = serde_json::Map::new();
        extra.insert("round".to_string(), json!(3));
        let effects = engine.broadcast("GAME", "CONTROLLER", extra);

        assert_eq!(effects.len(), 1);
        match &effects[0] {
            Effect::Send { conn, msg: ServerMessage::StateChange { state, context, player, extra } } => {
                assert_eq!(*conn, ConnId(1));
                assert_eq!(state, "GAME");
                assert_eq!(context, "CONTROLLER");
                assert_eq!(player.name, "P1");
                assert_eq!(extra["round"], json!(3));
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn test_command_relay_preserves_action_and_payload() {
        let mut engine = engine();
        let id = join(&mut engine, ConnId(1), "a", 0);

        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::Command {
                action: "NEXT_ROUND".to_string(),
                payload: Some(json!({"skip": true})),
            },
            10,
        );
        assert_eq!(
            effects,
            vec![Effect::Command {
                player_id: id,
                action: "NEXT_ROUND".to_string(),
                payload: Some(json!({"skip": true})),
            }]
        );
    }

    #[test]
    fn test_update_profile_patches_roster() {
        let mut engine = engine();
        let id = join(&mut engine, ConnId(1), "a", 0);

        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::UpdateProfile {
                payload: ProfilePatch {
                    name: Some("Zoe".to_string()),
                    ..Default::default()
                },
            },
            10,
        );
        assert_eq!(effects, vec![Effect::PlayerSetChanged]);
        assert_eq!(engine.roster().find_by_id(id).unwrap().profile.name, "Zoe");
    }

    #[test]
    fn test_hello_claiming_local_uuid_is_dropped() {
        let mut engine = SessionEngine::new(
            MemoryRoster::with_default_locals(),
            SessionConfig::default(),
        );
        engine.handle_open(ConnId(1), 0);
        let effects = engine.handle_message(
            ConnId(1),
            ClientMessage::Hello { uuid: "local-0".to_string() },
            0,
        );

        // The connection stays unregistered instead of binding to the
        // keyboard player.
        assert!(effects.is_empty());
        assert_eq!(engine.registry().player_of(ConnId(1)), None);

        // And the reaper never mistakes the keyboard seat for a silent
        // phone: both locals survive a full liveness window.
        engine.tick(THRESHOLD + 1_000);
        assert!(engine.roster().find_by_id(0).is_some());
        assert_eq!(engine.roster().list_active().len(), 2);
    }

    #[test]
    fn test_message_on_unknown_connection_is_ignored() {
        let mut engine = engine();
        let effects = engine.handle_message(
            ConnId(9),
            ClientMessage::Hello { uuid: "ghost".to_string() },
            0,
        );
        assert!(effects.is_empty());
        assert!(engine.roster().list_active().is_empty());
    }
}
