//! # Peer Identity
//!
//! Core identity types for the hive:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`PeerId`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! Apiary uses a simple identity model: **PeerId = Ed25519 Public Key**.
//!
//! - **Self-certifying**: possession of the private key proves identity,
//!   no external CA is involved
//! - **Globally referenced**: the `PeerId` keys every other table in the
//!   engine (membership, state map, intents) and is never owned by any
//!   single component
//! - **Totally ordered**: `PeerId: Ord` is byte-lexicographic, which is the
//!   order the intent lock manager uses for deterministic tie-breaks
//!
//! Admission to the hive is controlled by signed invitation tickets (see
//! `membership`), not by the identity layer itself: any valid Ed25519 key
//! is a well-formed identity, but only ticketed identities pass the
//! handshake.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamps in signed records (tickets, vouches, state entries).
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        self.signing_key
            .verifying_key()
            .verify(message, signature)
            .is_ok()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().to_hex())
            .finish_non_exhaustive()
    }
}

/// A peer's identity: its 32-byte Ed25519 public key.
///
/// `Ord` is byte-lexicographic. The intent tie-break relies on this order
/// being identical at every node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short hex prefix for log lines. Never log the full identity of an
    /// unauthenticated sender at elevated severity.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Check that the identity is a usable Ed25519 public key.
    ///
    /// Rejects the trivially-degenerate all-zero / all-0xFF patterns and
    /// any byte string that does not decompress to a valid curve point.
    pub fn is_valid(&self) -> bool {
        if self.0 == [0u8; 32] || self.0 == [0xFFu8; 32] {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short_hex())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trips_bytes() {
        let mut bytes = [0u8; 32];
        bytes[0] = 0xAB;
        bytes[31] = 0xCD;
        let id = PeerId::from_bytes(bytes);
        assert_eq!(*id.as_bytes(), bytes);
    }

    #[test]
    fn peer_id_hex_round_trip() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(PeerId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn peer_id_from_hex_rejects_bad_length() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex(&"ab".repeat(33)).is_err());
    }

    #[test]
    fn generated_identity_is_valid() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            assert!(keypair.peer_id().is_valid());
        }
    }

    #[test]
    fn degenerate_identities_rejected() {
        assert!(!PeerId::from_bytes([0u8; 32]).is_valid());
        assert!(!PeerId::from_bytes([0xFFu8; 32]).is_valid());
    }

    #[test]
    fn keypair_sign_verify() {
        let keypair = Keypair::generate();
        let msg = b"channel open announcement";
        let sig = keypair.sign(msg);
        assert!(keypair.verify(msg, &sig));
        assert!(!keypair.verify(b"different bytes", &sig));
    }

    #[test]
    fn keypair_secret_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.peer_id(), keypair.peer_id());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = PeerId::from_bytes([1u8; 32]);
        let mut b_bytes = [1u8; 32];
        b_bytes[31] = 2;
        let b = PeerId::from_bytes(b_bytes);
        assert!(a < b);
    }
}
