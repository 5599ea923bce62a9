//! # Signature Infrastructure
//!
//! Domain-separated Ed25519 signing and verification used by every signed
//! structure in the protocol: session attestations, tickets, vouches,
//! intents, state entries, and frame envelopes.
//!
//! ## Canonical Bytes
//!
//! Each signed structure has exactly one canonical byte encoding, produced
//! by a `canonical_*_bytes` builder colocated with the structure's type
//! (`membership`, `state`, `intent`, `handshake`). Fields are fixed-order
//! and length-prefixed little-endian; there is no locale, whitespace, or
//! map-ordering variance. Signers and verifiers call the same builder —
//! a signature is only ever checked against the bytes it was produced over.
//!
//! ## Domain Separation
//!
//! Every signature is computed over `domain ‖ canonical_bytes`. Each signed
//! structure has a unique domain prefix, so a signature produced for one
//! context can never verify in another (a vouch signature cannot be
//! replayed as an intent, an attestation cannot be replayed as a ticket).

use ed25519_dalek::{Signature, VerifyingKey};

use crate::identity::{Keypair, PeerId};

/// Error type for signature verification failures, shared by every
/// verification site in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain Separation Prefixes
// ============================================================================
//
// SECURITY: one unique prefix per signed structure. Kept in a single block
// so the full set is auditable at a glance.

/// Frame envelopes (signature over the serialized payload body).
pub const FRAME_SIGNATURE_DOMAIN: &[u8] = b"apiary-frame-v1:";

/// Handshake challenge responses (initiator proves key possession).
pub const CHALLENGE_SIGNATURE_DOMAIN: &[u8] = b"apiary-challenge-v1:";

/// Session attestations issued after a successful handshake.
pub const ATTEST_SIGNATURE_DOMAIN: &[u8] = b"apiary-attest-v1:";

/// Invitation tickets.
pub const TICKET_SIGNATURE_DOMAIN: &[u8] = b"apiary-ticket-v1:";

/// Promotion vouches.
pub const VOUCH_SIGNATURE_DOMAIN: &[u8] = b"apiary-vouch-v1:";

/// Intent-lock proposals and abort notices.
pub const INTENT_SIGNATURE_DOMAIN: &[u8] = b"apiary-intent-v1:";

/// Gossip state entries.
pub const STATE_ENTRY_SIGNATURE_DOMAIN: &[u8] = b"apiary-state-v1:";

// ============================================================================
// Domain-Separated Signature Helpers
// ============================================================================

/// Sign data with domain separation.
///
/// Prepends the domain prefix to the data before signing. Returns the
/// 64-byte Ed25519 signature as a `Vec<u8>`.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation.
///
/// Reconstructs the prefixed data and verifies the Ed25519 signature
/// against the claimed signer's public key using strict verification.
pub fn verify_with_domain(
    peer_id: &PeerId,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    if signature.len() != 64 {
        return Err(SignatureError::InvalidLength);
    }

    let verifying_key = VerifyingKey::try_from(peer_id.as_bytes().as_slice())
        .map_err(|_| SignatureError::InvalidPublicKey)?;

    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let keypair = Keypair::generate();
        let data = b"capacity=1200000";
        let sig = sign_with_domain(&keypair, STATE_ENTRY_SIGNATURE_DOMAIN, data);
        assert!(
            verify_with_domain(&keypair.peer_id(), STATE_ENTRY_SIGNATURE_DOMAIN, data, &sig)
                .is_ok()
        );
    }

    #[test]
    fn wrong_domain_rejected() {
        let keypair = Keypair::generate();
        let data = b"some payload";
        let sig = sign_with_domain(&keypair, VOUCH_SIGNATURE_DOMAIN, data);
        assert_eq!(
            verify_with_domain(&keypair.peer_id(), INTENT_SIGNATURE_DOMAIN, data, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_signer_rejected() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let data = b"payload";
        let sig = sign_with_domain(&signer, VOUCH_SIGNATURE_DOMAIN, data);
        assert_eq!(
            verify_with_domain(&other.peer_id(), VOUCH_SIGNATURE_DOMAIN, data, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_rejected() {
        let keypair = Keypair::generate();
        let id = keypair.peer_id();
        assert_eq!(
            verify_with_domain(&id, VOUCH_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&id, VOUCH_SIGNATURE_DOMAIN, b"x", &[0u8; 63]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn invalid_public_key_rejected() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, VOUCH_SIGNATURE_DOMAIN, b"x");
        // All-0xFF is not a valid curve point.
        let bogus = PeerId::from_bytes([0xFFu8; 32]);
        assert_eq!(
            verify_with_domain(&bogus, VOUCH_SIGNATURE_DOMAIN, b"x", &sig),
            Err(SignatureError::InvalidPublicKey)
        );
    }

    #[test]
    fn tampered_payload_rejected() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, TICKET_SIGNATURE_DOMAIN, b"invitee=a");
        assert!(verify_with_domain(
            &keypair.peer_id(),
            TICKET_SIGNATURE_DOMAIN,
            b"invitee=b",
            &sig
        )
        .is_err());
    }
}
