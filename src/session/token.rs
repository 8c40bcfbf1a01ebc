use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of every minted token (hex-encoded SHA-256).
pub const TOKEN_LEN: usize = 64;

/// Mints session tokens.
///
/// A token is the SHA-256 of the key, a fresh random nonce and the client
/// address. It never reveals its inputs, and minting twice for the same
/// key/address pair yields two unrelated tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenMinter;

impl TokenMinter {
    pub fn new() -> Self {
        Self
    }

    /// Mint a fresh token for `key` and `ip`.
    pub fn mint(&self, key: &str, ip: &str) -> String {
        let nonce = Uuid::new_v4();

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(nonce.as_bytes());
        hasher.update([0u8]);
        hasher.update(ip.as_bytes());

        hex::encode(hasher.finalize())
    }
}
