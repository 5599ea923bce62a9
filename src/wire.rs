//! # Wire Protocol Frames
//!
//! This module defines the frame envelope and every wire-level message type
//! in the hive protocol, plus their canonical signed-byte encodings.
//! Payloads are serialized with bincode under a hard size limit; the frame
//! envelope adds a magic prefix, a type tag, and an explicit length so that
//! malformed input is rejected before any payload allocation.
//!
//! ## Envelope Layout
//!
//! ```text
//! magic      [u8;4]  = b"HIVE"
//! frame_type u16 BE  — one tag per payload variant
//! length     u32 BE  — byte length of everything after the header
//! origin     [u8;32] — identity of the signer (the frame's originator)
//! sig_len    u16 BE  — 0 (unsigned) or 64
//! signature  [u8; sig_len] — origin's signature over the payload bytes
//! payload    bincode(FramePayload), bounded
//! ```
//!
//! Relayable frames (gossip, intents, promotions) keep their origin's
//! signature as they hop between members; the dispatcher verifies the
//! envelope against `origin`, while the transport authenticates the direct
//! sender separately. Direct-only frames (handshake, sync, vouches)
//! additionally require `origin` to equal the direct sender.
//!
//! ## Decode Contract
//!
//! `decode_frame` enforces, in order: total size ceiling, magic, known type
//! tag, length agreement, bounded payload decode, per-field bounds, and
//! tag/variant agreement. Any violation yields a typed [`DecodeError`] and
//! the frame is dropped whole — there is no partial decode, and nothing
//! panics across this boundary.
//!
//! ## Message Types
//!
//! | Frame | Direction | Purpose |
//! |-------|-----------|---------|
//! | `Hello`/`Challenge`/`Attest`/`Welcome` | handshake | challenge/response admission |
//! | `GossipPush` | broadcast | periodic fresh-entry summaries |
//! | `FullSyncRequest`/`FullSyncResponse` | request/response | digest-driven anti-entropy |
//! | `IntentProposed`/`Held`/`Committed`/`Aborted` | broadcast | intent-lock state machine |
//! | `Vouch`/`PromotionRequest`/`Promotion` | broadcast | membership governance |
//! | `Departure` | broadcast | voluntary exit |

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, FRAME_SIGNATURE_DOMAIN,
};
use crate::identity::{Keypair, PeerId};

// ============================================================================
// Size Ceilings
// ============================================================================

/// Magic bytes identifying hive protocol frames.
pub const FRAME_MAGIC: [u8; 4] = *b"HIVE";

/// Envelope header size: magic(4) + type(2) + length(4).
pub const HEADER_SIZE: usize = 10;

/// Fixed part of the body before the signature: origin(32) + sig_len(2).
const BODY_PREFIX: usize = 34;

/// Hard ceiling on total frame size (64 KiB).
/// SECURITY: checked before any payload allocation; an attacker-controlled
/// length field can never size a buffer past this.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum entries in a full-sync response.
pub const MAX_SYNC_ENTRIES: usize = 500;

/// Maximum roster records in a full-sync response. Together with the
/// entry byte budget this keeps a maximal response under the frame
/// ceiling.
pub const MAX_ROSTER_ENTRIES: usize = 300;

/// Maximum entries in a periodic gossip push. Sized so worst-case
/// profiles (full address and hint lists) still fit one frame.
pub const MAX_PUSH_ENTRIES: usize = 32;

/// Maximum rows in an anti-entropy digest.
pub const MAX_DIGEST_ENTRIES: usize = 1024;

/// Maximum vouches attached to a promotion frame.
pub const MAX_VOUCHES_PER_PROMOTION: usize = 64;

/// Maximum serialized ticket size. Enforced here at decode time and again
/// by `membership::Ticket::decode` before any structured parsing.
pub const MAX_TICKET_BYTES: usize = 512;

/// Maximum advertised addresses per peer profile.
pub const MAX_ADDRS_PER_PROFILE: usize = 8;

/// Maximum length of one advertised address string.
pub const MAX_ADDR_LEN: usize = 64;

/// Maximum topology hints per peer profile.
pub const MAX_HINTS_PER_PROFILE: usize = 32;

/// Ed25519 signature length.
const SIG_LEN: usize = 64;

/// Returns bincode options with the frame size limit enforced.
/// SECURITY: all payload deserialization goes through this; never call raw
/// `bincode::deserialize` on network input.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Deserialize with the frame size bound enforced.
pub(crate) fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Serialize with the same encoding (fixint) used for deserialization, so
/// canonical payload bytes are identical on both ends. The size limit is a
/// decode-side defense only; locally-built payloads are bounded by the
/// cardinality and byte budgets their builders enforce, and `encode_frame`
/// re-checks the total against [`MAX_FRAME_SIZE`].
pub(crate) fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .serialize(value)
}

// ============================================================================
// Decode Errors
// ============================================================================

/// Typed decode failure. Every variant means the frame was dropped whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Total frame size exceeds [`MAX_FRAME_SIZE`].
    Oversized { len: usize },
    /// Frame shorter than the fixed header.
    Truncated,
    /// Magic prefix mismatch.
    BadMagic,
    /// Unrecognized frame type tag.
    UnknownType(u16),
    /// Header length field disagrees with the actual byte count.
    LengthMismatch,
    /// Signature length is neither 0 nor 64.
    BadSignatureLength(usize),
    /// Payload failed bounded bincode decode.
    Malformed,
    /// Decoded variant does not match the header type tag.
    TagMismatch,
    /// A list or string field exceeds its declared maximum cardinality.
    FieldBound(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Oversized { len } => {
                write!(f, "frame of {} bytes exceeds {} byte ceiling", len, MAX_FRAME_SIZE)
            }
            DecodeError::Truncated => write!(f, "frame shorter than header"),
            DecodeError::BadMagic => write!(f, "bad magic prefix"),
            DecodeError::UnknownType(tag) => write!(f, "unknown frame type {:#06x}", tag),
            DecodeError::LengthMismatch => write!(f, "length field mismatch"),
            DecodeError::BadSignatureLength(len) => write!(f, "bad signature length {}", len),
            DecodeError::Malformed => write!(f, "malformed payload"),
            DecodeError::TagMismatch => write!(f, "payload variant does not match type tag"),
            DecodeError::FieldBound(field) => write!(f, "field bound exceeded: {}", field),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Wire Structures
// ============================================================================

/// Advertised facts about one peer: routing capacity, fee policy, uptime,
/// and topology hints. Carried inside [`StateEntry`] and covered by its
/// signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerProfile {
    /// Total routable capacity in millisatoshis.
    pub capacity_msat: u64,
    /// Base fee charged per forwarded HTLC, millisatoshis.
    pub fee_base_msat: u64,
    /// Proportional fee in parts-per-million.
    pub fee_rate_ppm: u32,
    /// Observed uptime in parts-per-million of the reporting window.
    pub uptime_ppm: u32,
    /// Dialable addresses, `host:port` strings.
    pub addrs: Vec<String>,
    /// Peers this node considers good expansion targets.
    pub topology_hints: Vec<PeerId>,
}

impl PeerProfile {
    fn validate(&self) -> Result<(), DecodeError> {
        if self.addrs.len() > MAX_ADDRS_PER_PROFILE {
            return Err(DecodeError::FieldBound("profile.addrs"));
        }
        if self.addrs.iter().any(|a| a.len() > MAX_ADDR_LEN) {
            return Err(DecodeError::FieldBound("profile.addr_len"));
        }
        if self.topology_hints.len() > MAX_HINTS_PER_PROFILE {
            return Err(DecodeError::FieldBound("profile.topology_hints"));
        }
        Ok(())
    }
}

/// One row of the hive's shared state map: a peer's self-reported profile
/// at a version, signed by that peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    pub peer_id: PeerId,
    /// Strictly-increasing version counter (wall-clock ms at the origin).
    pub version: u64,
    pub profile: PeerProfile,
    /// Signature by `peer_id` over [`StateEntry::canonical_bytes`].
    pub signature: Vec<u8>,
}

impl StateEntry {
    /// Canonical signed bytes: fixed field order, length-prefixed strings.
    /// The single encoding used by both the signer and every verifier.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(self.peer_id.as_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.profile.capacity_msat.to_le_bytes());
        out.extend_from_slice(&self.profile.fee_base_msat.to_le_bytes());
        out.extend_from_slice(&self.profile.fee_rate_ppm.to_le_bytes());
        out.extend_from_slice(&self.profile.uptime_ppm.to_le_bytes());
        out.extend_from_slice(&(self.profile.addrs.len() as u32).to_le_bytes());
        for addr in &self.profile.addrs {
            out.extend_from_slice(&(addr.len() as u32).to_le_bytes());
            out.extend_from_slice(addr.as_bytes());
        }
        out.extend_from_slice(&(self.profile.topology_hints.len() as u32).to_le_bytes());
        for hint in &self.profile.topology_hints {
            out.extend_from_slice(hint.as_bytes());
        }
        out
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.signature.len() != SIG_LEN {
            return Err(DecodeError::FieldBound("entry.signature"));
        }
        self.profile.validate()
    }
}

/// One row of an anti-entropy digest: the version we hold for a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRow {
    pub peer_id: PeerId,
    pub version: u64,
}

/// Exclusive fleet-visible actions coordinated through the intent lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IntentAction {
    /// Open a channel toward the target node.
    OpenChannel,
    /// Ban the target peer from the hive.
    BanPeer,
    /// Promote the target neophyte to member.
    PromoteMember,
}

impl IntentAction {
    /// Stable tag used in canonical bytes and relay fingerprints.
    pub fn tag(&self) -> u16 {
        match self {
            IntentAction::OpenChannel => 1,
            IntentAction::BanPeer => 2,
            IntentAction::PromoteMember => 3,
        }
    }
}

impl std::fmt::Display for IntentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentAction::OpenChannel => write!(f, "open-channel"),
            IntentAction::BanPeer => write!(f, "ban-peer"),
            IntentAction::PromoteMember => write!(f, "promote-member"),
        }
    }
}

/// A broadcast intent announcement, carried by all four intent frame types.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentAnnounce {
    pub action: IntentAction,
    pub target: PeerId,
    pub initiator: PeerId,
    /// Milliseconds since epoch at the initiator when proposed. Part of the
    /// replay key: terminal intents make identical announcements no-ops.
    pub proposed_at: u64,
    /// Signature by `initiator` over [`IntentAnnounce::canonical_bytes`].
    pub signature: Vec<u8>,
}

impl IntentAnnounce {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + 32 + 32 + 8);
        out.extend_from_slice(&self.action.tag().to_le_bytes());
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(self.initiator.as_bytes());
        out.extend_from_slice(&self.proposed_at.to_le_bytes());
        out
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.signature.len() != SIG_LEN {
            return Err(DecodeError::FieldBound("intent.signature"));
        }
        Ok(())
    }
}

/// A member's signed support for a peer's promotion.
///
/// The signature covers `request_id` and `timestamp`, so a vouch minted in
/// one promotion round can never be replayed into another. The engine
/// additionally requires `voucher` to equal the transport-authenticated
/// sender of the frame, independent of payload content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VouchRecord {
    pub target: PeerId,
    /// Identifies the promotion round this vouch belongs to.
    pub request_id: [u8; 16],
    pub voucher: PeerId,
    pub timestamp: u64,
    /// Signature by `voucher` over [`VouchRecord::canonical_bytes`].
    pub signature: Vec<u8>,
}

impl VouchRecord {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 16 + 32 + 8);
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(&self.request_id);
        out.extend_from_slice(self.voucher.as_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.signature.len() != SIG_LEN {
            return Err(DecodeError::FieldBound("vouch.signature"));
        }
        Ok(())
    }
}

/// Short-lived proof that a peer passed the handshake. Issued by the
/// responder; expiry forces a fresh handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttestation {
    /// The authenticated peer.
    pub peer_id: PeerId,
    pub issued_at: u64,
    pub expires_at: u64,
    /// Signature by the issuing responder over
    /// [`SessionAttestation::canonical_bytes`].
    pub signature: Vec<u8>,
}

impl SessionAttestation {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 8 + 8);
        out.extend_from_slice(self.peer_id.as_bytes());
        out.extend_from_slice(&self.issued_at.to_le_bytes());
        out.extend_from_slice(&self.expires_at.to_le_bytes());
        out
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    fn validate(&self) -> Result<(), DecodeError> {
        if self.signature.len() != SIG_LEN {
            return Err(DecodeError::FieldBound("attestation.signature"));
        }
        Ok(())
    }
}

// ============================================================================
// Frame Payloads
// ============================================================================

/// Every message the protocol speaks. One type tag per variant; the
/// tag↔variant mapping is two exhaustive `match`es, so adding a variant
/// without wiring its tag fails to compile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FramePayload {
    /// Connection opener: the initiator declares its identity.
    Hello { peer_id: PeerId, protocol_version: u16 },
    /// Responder's challenge nonce.
    Challenge { nonce: [u8; 32], expires_at: u64 },
    /// Initiator's proof: signature over the nonce plus an invitation ticket.
    Attest {
        peer_id: PeerId,
        /// Signature over the canonical challenge-response bytes.
        nonce_signature: Vec<u8>,
        /// Raw serialized ticket; decoded by `membership::Ticket::decode`
        /// only after the byte-length ceiling here has passed.
        ticket: Vec<u8>,
    },
    /// Responder's grant after a successful handshake.
    Welcome { attestation: SessionAttestation },
    /// Periodic push of fresh locally-known entries.
    GossipPush { entries: Vec<StateEntry> },
    /// Anti-entropy: the requester's per-peer version digest.
    FullSyncRequest { digest: Vec<DigestRow> },
    /// Entries strictly newer than the requester's digest, capped, plus
    /// the responder's membership roster for joiner bootstrap.
    FullSyncResponse {
        entries: Vec<StateEntry>,
        roster: Vec<crate::membership::MembershipRecord>,
    },
    IntentProposed { intent: IntentAnnounce },
    IntentHeld { intent: IntentAnnounce },
    IntentCommitted { intent: IntentAnnounce },
    IntentAborted { intent: IntentAnnounce },
    Vouch { vouch: VouchRecord },
    /// A neophyte asking members to open a promotion round.
    PromotionRequest { target: PeerId, request_id: [u8; 16] },
    /// Quorum reached: the collected vouches proving it.
    Promotion {
        target: PeerId,
        request_id: [u8; 16],
        vouches: Vec<VouchRecord>,
    },
    /// Voluntary departure notice.
    Departure { peer_id: PeerId },
    /// A member announcing that it admitted a new neophyte.
    Joined {
        record: crate::membership::MembershipRecord,
    },
}

impl FramePayload {
    /// Frame type tag for the envelope header. Exhaustive by construction.
    pub fn type_tag(&self) -> u16 {
        match self {
            FramePayload::Hello { .. } => 0x0001,
            FramePayload::Challenge { .. } => 0x0002,
            FramePayload::Attest { .. } => 0x0003,
            FramePayload::Welcome { .. } => 0x0004,
            FramePayload::GossipPush { .. } => 0x0010,
            FramePayload::FullSyncRequest { .. } => 0x0011,
            FramePayload::FullSyncResponse { .. } => 0x0012,
            FramePayload::IntentProposed { .. } => 0x0020,
            FramePayload::IntentHeld { .. } => 0x0021,
            FramePayload::IntentCommitted { .. } => 0x0022,
            FramePayload::IntentAborted { .. } => 0x0023,
            FramePayload::Vouch { .. } => 0x0030,
            FramePayload::PromotionRequest { .. } => 0x0031,
            FramePayload::Promotion { .. } => 0x0032,
            FramePayload::Departure { .. } => 0x0033,
            FramePayload::Joined { .. } => 0x0034,
        }
    }

    /// Whether a tag names a known frame type. The inverse of `type_tag`;
    /// both `match`es must be updated together or decode tests fail.
    pub fn tag_is_known(tag: u16) -> bool {
        matches!(
            tag,
            0x0001 | 0x0002 | 0x0003 | 0x0004 | 0x0010 | 0x0011 | 0x0012 | 0x0020 | 0x0021
                | 0x0022 | 0x0023 | 0x0030 | 0x0031 | 0x0032 | 0x0033 | 0x0034
        )
    }

    /// Handshake frames are the only traffic accepted from a connection
    /// that has not yet produced a live attestation.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            FramePayload::Hello { .. }
                | FramePayload::Challenge { .. }
                | FramePayload::Attest { .. }
                | FramePayload::Welcome { .. }
        )
    }

    /// Frames that hop between members via the relay layer. Everything
    /// else is point-to-point and must originate from its direct sender.
    pub fn is_relayable(&self) -> bool {
        matches!(
            self,
            FramePayload::GossipPush { .. }
                | FramePayload::IntentProposed { .. }
                | FramePayload::IntentHeld { .. }
                | FramePayload::IntentCommitted { .. }
                | FramePayload::IntentAborted { .. }
                | FramePayload::PromotionRequest { .. }
                | FramePayload::Promotion { .. }
                | FramePayload::Departure { .. }
                | FramePayload::Joined { .. }
        )
    }

    /// Per-field bounds, checked after structural decode and before the
    /// frame is released to callers.
    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            FramePayload::Hello { .. } | FramePayload::Departure { .. } => Ok(()),
            FramePayload::Challenge { .. } => Ok(()),
            FramePayload::Attest {
                nonce_signature,
                ticket,
                ..
            } => {
                if nonce_signature.len() != SIG_LEN {
                    return Err(DecodeError::FieldBound("attest.nonce_signature"));
                }
                if ticket.len() > MAX_TICKET_BYTES {
                    return Err(DecodeError::FieldBound("attest.ticket"));
                }
                Ok(())
            }
            FramePayload::Welcome { attestation } => attestation.validate(),
            FramePayload::GossipPush { entries } => {
                if entries.len() > MAX_PUSH_ENTRIES {
                    return Err(DecodeError::FieldBound("gossip_push.entries"));
                }
                entries.iter().try_for_each(StateEntry::validate)
            }
            FramePayload::FullSyncRequest { digest } => {
                if digest.len() > MAX_DIGEST_ENTRIES {
                    return Err(DecodeError::FieldBound("full_sync_request.digest"));
                }
                Ok(())
            }
            FramePayload::FullSyncResponse { entries, roster } => {
                if entries.len() > MAX_SYNC_ENTRIES {
                    return Err(DecodeError::FieldBound("full_sync_response.entries"));
                }
                if roster.len() > MAX_ROSTER_ENTRIES {
                    return Err(DecodeError::FieldBound("full_sync_response.roster"));
                }
                entries.iter().try_for_each(StateEntry::validate)
            }
            FramePayload::IntentProposed { intent }
            | FramePayload::IntentHeld { intent }
            | FramePayload::IntentCommitted { intent }
            | FramePayload::IntentAborted { intent } => intent.validate(),
            FramePayload::Vouch { vouch } => vouch.validate(),
            FramePayload::PromotionRequest { .. } => Ok(()),
            FramePayload::Promotion { vouches, .. } => {
                if vouches.len() > MAX_VOUCHES_PER_PROMOTION {
                    return Err(DecodeError::FieldBound("promotion.vouches"));
                }
                vouches.iter().try_for_each(VouchRecord::validate)
            }
            FramePayload::Joined { .. } => Ok(()),
        }
    }
}

// ============================================================================
// Frame Envelope
// ============================================================================

/// A decoded frame: the originator's identity, the payload, and the
/// originator's envelope signature over the serialized payload body.
///
/// `origin` is who signed the frame — for relayed frames this differs from
/// the direct transport sender.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub origin: PeerId,
    pub payload: FramePayload,
    pub signature: Vec<u8>,
}

impl Frame {
    /// Build an unsigned frame (handshake opener traffic only).
    pub fn unsigned(origin: PeerId, payload: FramePayload) -> Self {
        Self {
            origin,
            payload,
            signature: Vec::new(),
        }
    }

    /// Build a frame with the envelope signature over the payload bytes.
    pub fn signed(payload: FramePayload, keypair: &Keypair) -> Self {
        let body = serialize_payload(&payload).expect("payload serialization is infallible");
        let signature = sign_with_domain(keypair, FRAME_SIGNATURE_DOMAIN, &body);
        Self {
            origin: keypair.peer_id(),
            payload,
            signature,
        }
    }

    /// Verify the envelope signature against the frame's declared origin.
    pub fn verify_signature(&self) -> Result<(), SignatureError> {
        let body =
            serialize_payload(&self.payload).map_err(|_| SignatureError::VerificationFailed)?;
        verify_with_domain(&self.origin, FRAME_SIGNATURE_DOMAIN, &body, &self.signature)
    }
}

/// Encode a frame into its wire representation.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, DecodeError> {
    let payload_bytes = serialize_payload(&frame.payload).map_err(|_| DecodeError::Malformed)?;
    let sig_len = frame.signature.len();
    if sig_len != 0 && sig_len != SIG_LEN {
        return Err(DecodeError::BadSignatureLength(sig_len));
    }
    let body_len = BODY_PREFIX + sig_len + payload_bytes.len();
    if HEADER_SIZE + body_len > MAX_FRAME_SIZE {
        return Err(DecodeError::Oversized {
            len: HEADER_SIZE + body_len,
        });
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + body_len);
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&frame.payload.type_tag().to_be_bytes());
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(frame.origin.as_bytes());
    out.extend_from_slice(&(sig_len as u16).to_be_bytes());
    out.extend_from_slice(&frame.signature);
    out.extend_from_slice(&payload_bytes);
    Ok(out)
}

/// Decode a wire frame. Total: every failure is a typed error, nothing is
/// partially applied, and no allocation is proportional to a violating
/// length field.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, DecodeError> {
    // (a) total size ceiling before anything else
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::Oversized { len: bytes.len() });
    }
    if bytes.len() < HEADER_SIZE + BODY_PREFIX {
        return Err(DecodeError::Truncated);
    }

    // (b) magic and type tag
    if bytes[0..4] != FRAME_MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let tag = u16::from_be_bytes([bytes[4], bytes[5]]);
    if !FramePayload::tag_is_known(tag) {
        return Err(DecodeError::UnknownType(tag));
    }

    // (c) declared length must match what actually arrived
    let declared = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    if HEADER_SIZE + declared != bytes.len() {
        return Err(DecodeError::LengthMismatch);
    }

    let body = &bytes[HEADER_SIZE..];
    let mut origin_bytes = [0u8; 32];
    origin_bytes.copy_from_slice(&body[..32]);
    let origin = PeerId::from_bytes(origin_bytes);
    let sig_len = u16::from_be_bytes([body[32], body[33]]) as usize;
    if sig_len != 0 && sig_len != SIG_LEN {
        return Err(DecodeError::BadSignatureLength(sig_len));
    }
    if body.len() < BODY_PREFIX + sig_len {
        return Err(DecodeError::Truncated);
    }
    let signature = body[BODY_PREFIX..BODY_PREFIX + sig_len].to_vec();
    let payload_bytes = &body[BODY_PREFIX + sig_len..];

    // (d) bounded structural decode, then per-field bounds
    let payload: FramePayload =
        deserialize_bounded(payload_bytes).map_err(|_| DecodeError::Malformed)?;
    payload.validate()?;

    // (e) decoded variant must agree with the header tag
    if payload.type_tag() != tag {
        return Err(DecodeError::TagMismatch);
    }

    Ok(Frame {
        origin,
        payload,
        signature,
    })
}
