//! Connection Registry
//!
//! Authoritative map from transport connection to bound player, last
//! heartbeat and measured round-trip time, plus the derived `system_lag`
//! scalar read by the fairness delay injector.

use std::collections::BTreeMap;

use crate::roster::PlayerId;

/// Opaque transport connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Per-connection registry entry.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Bound player id. `None` until the handshake completes; the
    /// transition happens exactly once.
    pub player: Option<PlayerId>,
    /// Wall-clock time (ms) of the last inbound message.
    pub last_heartbeat_ms: u64,
    /// Last measured round-trip time (ms).
    pub rtt_ms: u64,
}

/// Live connections and the aggregate latency derived from them.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: BTreeMap<ConnId, ConnectionEntry>,
    system_lag_ms: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly opened, still unregistered connection.
    pub fn open(&mut self, conn: ConnId, now_ms: u64) {
        self.conns.insert(
            conn,
            ConnectionEntry {
                player: None,
                last_heartbeat_ms: now_ms,
                rtt_ms: 0,
            },
        );
    }

    /// Bind a connection to a player, completing its handshake. Resets
    /// the heartbeat clock and the rtt sample.
    pub fn bind(&mut self, conn: ConnId, player: PlayerId, now_ms: u64) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.player = Some(player);
            entry.last_heartbeat_ms = now_ms;
            entry.rtt_ms = 0;
        }
        self.recompute_lag();
    }

    /// Drop a connection. Returns its entry if it was tracked.
    pub fn remove(&mut self, conn: ConnId) -> Option<ConnectionEntry> {
        let entry = self.conns.remove(&conn);
        if entry.is_some() {
            self.recompute_lag();
        }
        entry
    }

    /// Refresh the liveness clock of a connection. Any inbound message
    /// counts, not just explicit heartbeats.
    pub fn touch(&mut self, conn: ConnId, now_ms: u64) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.last_heartbeat_ms = now_ms;
        }
    }

    /// Store a new rtt sample for a connection.
    pub fn record_rtt(&mut self, conn: ConnId, rtt_ms: u64) {
        if let Some(entry) = self.conns.get_mut(&conn) {
            entry.rtt_ms = rtt_ms;
            self.recompute_lag();
        }
    }

    /// Look up an entry.
    pub fn get(&self, conn: ConnId) -> Option<&ConnectionEntry> {
        self.conns.get(&conn)
    }

    /// Player bound to a connection, if registered.
    pub fn player_of(&self, conn: ConnId) -> Option<PlayerId> {
        self.conns.get(&conn).and_then(|e| e.player)
    }

    /// Connection currently bound to a player, if any.
    pub fn find_by_player(&self, player: PlayerId) -> Option<ConnId> {
        self.conns
            .iter()
            .find(|(_, e)| e.player == Some(player))
            .map(|(conn, _)| *conn)
    }

    /// Iterate registered connections only.
    pub fn registered(&self) -> impl Iterator<Item = (ConnId, &ConnectionEntry)> {
        self.conns
            .iter()
            .filter(|(_, e)| e.player.is_some())
            .map(|(conn, e)| (*conn, e))
    }

    /// Number of registered connections.
    pub fn registered_count(&self) -> usize {
        self.registered().count()
    }

    /// Current fairness delay: estimated one-way transit time (ms).
    pub fn system_lag_ms(&self) -> u64 {
        self.system_lag_ms
    }

    /// Recompute `system_lag` from the latest rtt sample of every
    /// registered connection: floor(mean(rtt) / 2). A keyboard input
    /// pays no network leg while a phone input pays one each way, so
    /// half the round trip is the delay that levels them.
    fn recompute_lag(&mut self) {
        let mut total = 0u64;
        let mut count = 0u64;
        for (_, entry) in self.registered() {
            total += entry.rtt_ms;
            count += 1;
        }
        self.system_lag_ms = if count == 0 { 0 } else { total / count / 2 };
    }
}
