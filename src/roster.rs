//! Player Roster
//!
//! Player records consumed by the session layer through a narrow
//! interface. The roster owns identity-to-cosmetics mapping and seat
//! allocation (colors, keyboard keys); the session layer only creates,
//! finds, patches and removes records through [`PlayerRoster`].

use serde::{Deserialize, Serialize};

/// Unique player identifier, stable for the lifetime of a hosting session.
pub type PlayerId = u32;

/// Where a player's inputs come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerKind {
    /// Keyboard player on the shared display.
    Local,
    /// Phone player connected over the data channel.
    Remote,
}

/// Cosmetic fields mirrored to phones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosmeticProfile {
    /// Display name.
    pub name: String,
    /// Avatar color (hex string).
    pub color: String,
    /// Equipped accessory.
    pub accessory: String,
    /// Visual variant of the avatar.
    pub variant: String,
}

/// Partial cosmetic update from a self-service profile edit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePatch {
    /// New display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New avatar color.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// New accessory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessory: Option<String>,
    /// New visual variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// Keyboard binding for a local player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBinding {
    /// Key value as reported by the display's key events.
    pub key: String,
    /// Human-readable label shown in the lobby.
    pub label: String,
}

/// One human participant.
#[derive(Debug, Clone)]
pub struct Player {
    /// Session-stable identifier.
    pub id: PlayerId,
    /// Durable identity string. Remote players supply theirs during the
    /// handshake; local players use fixed synthetic uuids.
    pub uuid: String,
    /// Local keyboard or remote phone.
    pub kind: PlayerKind,
    /// Current cosmetics.
    pub profile: CosmeticProfile,
    /// Keyboard binding (local players only).
    pub key: Option<KeyBinding>,
}

/// Roster interface consumed by the session layer.
pub trait PlayerRoster {
    /// Find a player by durable identity.
    fn find_by_uuid(&self, uuid: &str) -> Option<&Player>;

    /// Find a player by session id.
    fn find_by_id(&self, id: PlayerId) -> Option<&Player>;

    /// Create a new player record with default cosmetics.
    ///
    /// Returns `None` when no seat is available (local key pool exhausted).
    fn create(&mut self, kind: PlayerKind, uuid: &str) -> Option<&Player>;

    /// Remove a player record. Returns the removed record if it existed.
    fn remove_by_id(&mut self, id: PlayerId) -> Option<Player>;

    /// Apply a cosmetic patch. Returns false if the player is unknown.
    fn update_by_id(&mut self, id: PlayerId, patch: &ProfilePatch) -> bool;

    /// All current players, in join order.
    fn list_active(&self) -> Vec<&Player>;
}

/// Color palette handed out to newly joined players.
const PALETTE: [&str; 6] = [
    "#2ecc71", "#e67e22", "#1abc9c", "#e84393", "#9b59b6", "#3498db",
];

/// Fallback color once the palette is exhausted.
const FALLBACK_COLOR: &str = "#333333";

/// Keyboard key pool for local co-op seats.
const KEY_POOL: [(&str, &str); 6] = [
    ("Shift", "L-Shift"),
    (" ", "Space"),
    ("+", "+"),
    ("Enter", "Enter"),
    ("z", "Z"),
    ("m", "M"),
];

/// Default accessory for new players.
const DEFAULT_ACCESSORY: &str = "Bear Ears";

/// In-memory roster, the default collaborator for one hosting session.
#[derive(Debug, Default)]
pub struct MemoryRoster {
    players: Vec<Player>,
}

impl MemoryRoster {
    /// Create an empty roster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a roster pre-seeded with the two default keyboard players.
    pub fn with_default_locals() -> Self {
        let players = vec![
            Player {
                id: 0,
                uuid: "local-0".to_string(),
                kind: PlayerKind::Local,
                profile: CosmeticProfile {
                    name: "Red".to_string(),
                    color: "#E24A4A".to_string(),
                    accessory: "Cat Ears".to_string(),
                    variant: "default".to_string(),
                },
                key: Some(KeyBinding {
                    key: "Shift".to_string(),
                    label: "L-Shift".to_string(),
                }),
            },
            Player {
                id: 1,
                uuid: "local-1".to_string(),
                kind: PlayerKind::Local,
                profile: CosmeticProfile {
                    name: "Yellow".to_string(),
                    color: "#F4B84D".to_string(),
                    accessory: "Bow".to_string(),
                    variant: "feminine".to_string(),
                },
                key: Some(KeyBinding {
                    key: " ".to_string(),
                    label: "Space".to_string(),
                }),
            },
        ];
        Self { players }
    }

    /// Next id, gap-tolerant when players have left.
    fn next_id(&self) -> PlayerId {
        self.players.iter().map(|p| p.id + 1).max().unwrap_or(0)
    }

    /// First palette color not currently in use.
    fn next_color(&self) -> String {
        PALETTE
            .iter()
            .find(|c| !self.players.iter().any(|p| p.profile.color == **c))
            .unwrap_or(&FALLBACK_COLOR)
            .to_string()
    }

    /// First keyboard key not currently bound.
    fn next_key(&self) -> Option<KeyBinding> {
        KEY_POOL
            .iter()
            .find(|(key, _)| {
                !self
                    .players
                    .iter()
                    .any(|p| p.key.as_ref().map(|k| k.key.as_str()) == Some(*key))
            })
            .map(|(key, label)| KeyBinding {
                key: key.to_string(),
                label: label.to_string(),
            })
    }
}

impl PlayerRoster for MemoryRoster {
    fn find_by_uuid(&self, uuid: &str) -> Option<&Player> {
        self.players.iter().find(|p| p.uuid == uuid)
    }

    fn find_by_id(&self, id: PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| p.id == id)
    }

    fn create(&mut self, kind: PlayerKind, uuid: &str) -> Option<&Player> {
        let key = match kind {
            PlayerKind::Local => Some(self.next_key()?),
            PlayerKind::Remote => None,
        };

        let id = self.next_id();
        let player = Player {
            id,
            uuid: uuid.to_string(),
            kind,
            profile: CosmeticProfile {
                name: format!("P{}", id + 1),
                color: self.next_color(),
                accessory: DEFAULT_ACCESSORY.to_string(),
                variant: "default".to_string(),
            },
            key,
        };

        self.players.push(player);
        self.players.last()
    }

    fn remove_by_id(&mut self, id: PlayerId) -> Option<Player> {
        let idx = self.players.iter().position(|p| p.id == id)?;
        Some(self.players.remove(idx))
    }

    fn update_by_id(&mut self, id: PlayerId, patch: &ProfilePatch) -> bool {
        let Some(player) = self.players.iter_mut().find(|p| p.id == id) else {
            return false;
        };

        if let Some(name) = &patch.name {
            player.profile.name = name.clone();
        }
        if let Some(color) = &patch.color {
            player.profile.color = color.clone();
        }
        if let Some(accessory) = &patch.accessory {
            player.profile.accessory = accessory.clone();
        }
        if let Some(variant) = &patch.variant {
            player.profile.variant = variant.clone();
        }
        true
    }

    fn list_active(&self) -> Vec<&Player> {
        self.players.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_locals() {
        let roster = MemoryRoster::with_default_locals();
        let players = roster.list_active();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].kind, PlayerKind::Local);
        assert_eq!(players[0].key.as_ref().unwrap().key, "Shift");
        assert_eq!(players[1].key.as_ref().unwrap().key, " ");
    }

    #[test]
    fn test_create_remote_player() {
        let mut roster = MemoryRoster::with_default_locals();
        let player = roster.create(PlayerKind::Remote, "abc-123").unwrap();

        assert_eq!(player.id, 2);
        assert_eq!(player.uuid, "abc-123");
        assert_eq!(player.profile.name, "P3");
        assert!(player.key.is_none());
    }

    #[test]
    fn test_id_allocation_survives_gaps() {
        let mut roster = MemoryRoster::new();
        let a = roster.create(PlayerKind::Remote, "a").unwrap().id;
        let b = roster.create(PlayerKind::Remote, "b").unwrap().id;
        assert_eq!((a, b), (0, 1));

        roster.remove_by_id(0);
        let c = roster.create(PlayerKind::Remote, "c").unwrap().id;
        // Never reuses a live-session id.
        assert_eq!(c, 2);
    }

    #[test]
    fn test_colors_are_unique_until_palette_runs_out() {
        let mut roster = MemoryRoster::new();
        let mut colors = Vec::new();
        for i in 0..PALETTE.len() {
            let p = roster.create(PlayerKind::Remote, &format!("u{i}")).unwrap();
            colors.push(p.profile.color.clone());
        }
        colors.sort();
        colors.dedup();
        assert_eq!(colors.len(), PALETTE.len());

        let overflow = roster.create(PlayerKind::Remote, "extra").unwrap();
        assert_eq!(overflow.profile.color, FALLBACK_COLOR);
    }

    #[test]
    fn test_local_key_pool_exhaustion() {
        let mut roster = MemoryRoster::new();
        for i in 0..KEY_POOL.len() {
            assert!(roster.create(PlayerKind::Local, &format!("local-{i}")).is_some());
        }
        assert!(roster.create(PlayerKind::Local, "local-extra").is_none());
        // Remote seats are unaffected by the key pool.
        assert!(roster.create(PlayerKind::Remote, "phone").is_some());
    }

    #[test]
    fn test_profile_patch() {
        let mut roster = MemoryRoster::with_default_locals();
        let patch = ProfilePatch {
            name: Some("Ruby".to_string()),
            accessory: Some("Crown".to_string()),
            ..Default::default()
        };

        assert!(roster.update_by_id(0, &patch));
        let player = roster.find_by_id(0).unwrap();
        assert_eq!(player.profile.name, "Ruby");
        assert_eq!(player.profile.accessory, "Crown");
        // Untouched fields survive.
        assert_eq!(player.profile.color, "#E24A4A");

        assert!(!roster.update_by_id(99, &patch));
    }

    #[test]
    fn test_find_by_uuid() {
        let mut roster = MemoryRoster::with_default_locals();
        roster.create(PlayerKind::Remote, "phone-uuid").unwrap();

        assert_eq!(roster.find_by_uuid("phone-uuid").unwrap().id, 2);
        assert!(roster.find_by_uuid("unknown").is_none());
    }
}
