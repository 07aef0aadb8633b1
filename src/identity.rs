//! Transport-agnostic client identity.
//!
//! Equality and hashing cover only `(client_id, device_id)`; the session
//! token exists purely to authenticate reconnects and never participates
//! in identity comparison, so a token rotation does not change who the
//! client is.

use std::hash::{Hash, Hasher};

use rand::RngCore;

/// 128-bit reconnect token.
pub type SessionToken = [u8; 16];

/// Identity of a connecting client.
#[derive(Clone, Debug, Default)]
pub struct ClientIdentity {
    pub client_id: String,
    pub device_id: u64,
    /// Random reconnect token; all-zero means "none presented".
    pub session_token: SessionToken,
}

impl ClientIdentity {
    /// Build an identity without a token.
    #[must_use]
    pub fn new(client_id: impl Into<String>, device_id: u64) -> Self {
        Self {
            client_id: client_id.into(),
            device_id,
            session_token: SessionToken::default(),
        }
    }

    /// Whether any token byte is set.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.session_token.iter().any(|&b| b != 0)
    }

    /// Fill the token with fresh random bytes.
    pub fn refresh_token(&mut self) {
        rand::thread_rng().fill_bytes(&mut self.session_token);
    }
}

impl PartialEq for ClientIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.client_id == other.client_id && self.device_id == other.device_id
    }
}

impl Eq for ClientIdentity {}

impl Hash for ClientIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.client_id.hash(state);
        self.device_id.hash(state);
    }
}

/// Render a token as 32 lowercase hex characters.
#[must_use]
pub fn token_to_hex(token: &SessionToken) -> String {
    let mut out = String::with_capacity(32);
    for byte in token {
        out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
        out.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
    }
    out
}

/// Parse a 32-character hex string back into a token.
#[must_use]
pub fn token_from_hex(text: &str) -> Option<SessionToken> {
    if text.len() != 32 {
        return None;
    }
    let mut token = SessionToken::default();
    for (i, chunk) in text.as_bytes().chunks_exact(2).enumerate() {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        token[i] = ((hi << 4) | lo) as u8;
    }
    Some(token)
}
