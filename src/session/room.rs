//! Room Identity
//!
//! Short human-typeable room codes and the deterministic listening
//! address derived from them. A client needs nothing but the code to
//! find the host: the accept path is a fixed prefix plus the code, and
//! the port is folded out of a hash of the code.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Code alphabet. 32 symbols, excluding the characters most easily
/// confused when read aloud or handwritten (no 0/O, no 1/I).
pub const ROOM_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Fixed room code length.
pub const ROOM_CODE_LEN: usize = 4;

/// Fixed prefix of the listening address.
pub const ROOM_PREFIX: &str = "party-";

/// First port of the derived-port range.
const PORT_BASE: u16 = 41000;

/// Size of the derived-port range.
const PORT_RANGE: u16 = 1024;

/// Errors from parsing a room code typed by a user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomCodeError {
    /// Code has the wrong length.
    #[error("room code must be {ROOM_CODE_LEN} characters, got {0}")]
    BadLength(usize),

    /// Code contains a character outside the alphabet.
    #[error("room code contains invalid character {0:?}")]
    BadCharacter(char),
}

/// Identity of one hosting session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomId {
    code: String,
}

impl RoomId {
    /// Generate a fresh random room code.
    pub fn generate() -> Self {
        // 256 % 32 == 0, so reducing a random byte into the alphabet
        // introduces no bias.
        let entropy = Uuid::new_v4();
        let code = entropy.as_bytes()[..ROOM_CODE_LEN]
            .iter()
            .map(|b| ROOM_CODE_ALPHABET[(b % 32) as usize] as char)
            .collect();
        Self { code }
    }

    /// Parse a code typed by a user. Lowercase input is accepted.
    pub fn from_code(code: &str) -> Result<Self, RoomCodeError> {
        let code = code.to_ascii_uppercase();
        let char_count = code.chars().count();
        if char_count != ROOM_CODE_LEN {
            return Err(RoomCodeError::BadLength(char_count));
        }
        for c in code.chars() {
            // The ascii check must come first: casting a wider
            // codepoint to u8 keeps only its low byte.
            if !c.is_ascii() || !ROOM_CODE_ALPHABET.contains(&(c as u8)) {
                return Err(RoomCodeError::BadCharacter(c));
            }
        }
        Ok(Self { code })
    }

    /// The short shareable code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Globally addressable session identifier: prefix + code. Used as
    /// the accept path of the listening endpoint.
    pub fn address(&self) -> String {
        format!("{ROOM_PREFIX}{}", self.code)
    }

    /// Listening port derived deterministically from the code, so both
    /// ends compute the same endpoint independently.
    pub fn derive_port(&self) -> u16 {
        let digest = Sha256::digest(self.code.as_bytes());
        let folded = u16::from_be_bytes([digest[0], digest[1]]);
        PORT_BASE + folded % PORT_RANGE
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.code)
    }
}
