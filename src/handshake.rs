//! # Handshake Engine
//!
//! Challenge/response admission control. A connecting peer must prove it
//! controls its claimed key and present a valid invitation ticket before
//! any of its gossip or intent traffic is processed.
//!
//! ## Flow
//!
//! ```text
//! initiator                         responder
//!    | -- Hello{peer_id} -------------> |   issue Challenge, cache it
//!    | <-- Challenge{nonce} ----------- |
//!    | -- Attest{sig(nonce), ticket} -> |   verify sig + identity + ticket
//!    | <-- Welcome{attestation} ------- |   admit membership, mint attestation
//! ```
//!
//! States per attempt: `Idle → ChallengeSent → Authenticated` or
//! `→ Rejected` (terminal at any step). Verification failure evicts the
//! pending challenge and mutates nothing else.
//!
//! ## Flood Resistance
//!
//! Pending challenges live in a bounded LRU cache (default 1,000 entries).
//! A flood of spurious handshake attempts can only evict *older* pending
//! challenges, never grow the cache; recent legitimate requesters stay.
//! Expired challenges and attestations are swept on a periodic tick.
//!
//! Successful handshakes yield a [`SessionAttestation`] with a bounded
//! lifetime; expiry forces a fresh handshake.

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, ATTEST_SIGNATURE_DOMAIN,
    CHALLENGE_SIGNATURE_DOMAIN,
};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::membership::{Membership, MembershipRecord, Ticket, TicketError};
use crate::wire::SessionAttestation;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct HandshakeConfig {
    /// Pending-challenge cache capacity. Oldest-first eviction under flood.
    pub challenge_cache_capacity: usize,
    /// How long an issued challenge stays answerable.
    pub challenge_lifetime: Duration,
    /// Attestation lifetime; expiry forces re-handshake.
    pub session_lifetime: Duration,
    /// Interval for the expiry sweep over challenges and attestations.
    pub sweep_interval: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            challenge_cache_capacity: 1_000,
            challenge_lifetime: Duration::from_secs(30),
            session_lifetime: Duration::from_secs(3_600),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Attestation book capacity. Matches the challenge cache bound: a node
/// with more live sessions than this is re-handshaking the overflow.
const MAX_LIVE_ATTESTATIONS: usize = 1_000;

/// Command channel capacity for the handshake actor.
const HANDSHAKE_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Claimed identity is not a valid Ed25519 point.
    InvalidIdentity,
    /// No pending challenge for this peer (never issued, expired out, or
    /// evicted under flood).
    NoChallenge,
    /// Challenge expired before the response arrived.
    ChallengeExpired,
    /// Claimed identity differs from the transport-verified identity.
    IdentityMismatch,
    /// Nonce signature does not verify against the claimed key.
    BadSignature(SignatureError),
    /// Ticket failed decoding or validation.
    Ticket(TicketError),
    /// Unknown peer presented no ticket. Members may re-handshake without
    /// one; strangers may not.
    TicketRequired,
    /// Engine unavailable (shutting down).
    Unavailable,
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeError::InvalidIdentity => write!(f, "claimed identity is not a valid key"),
            HandshakeError::NoChallenge => write!(f, "no pending challenge"),
            HandshakeError::ChallengeExpired => write!(f, "challenge expired"),
            HandshakeError::IdentityMismatch => {
                write!(f, "claimed identity does not match transport identity")
            }
            HandshakeError::BadSignature(e) => write!(f, "challenge response: {}", e),
            HandshakeError::Ticket(e) => write!(f, "ticket: {}", e),
            HandshakeError::TicketRequired => write!(f, "unknown peer presented no ticket"),
            HandshakeError::Unavailable => write!(f, "handshake engine unavailable"),
        }
    }
}

impl std::error::Error for HandshakeError {}

// ============================================================================
// Challenge
// ============================================================================

#[derive(Clone, Debug)]
pub struct Challenge {
    pub nonce: [u8; 32],
    pub issued_to: PeerId,
    pub issued_at: u64,
    pub expires_at: u64,
}

impl Challenge {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Canonical bytes signed by the initiator to answer a challenge: its own
/// identity followed by the nonce, binding the response to both.
pub fn canonical_challenge_response_bytes(responder_peer: &PeerId, nonce: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(32 + 32);
    out.extend_from_slice(responder_peer.as_bytes());
    out.extend_from_slice(nonce);
    out
}

/// Initiator side: sign a received challenge nonce.
pub fn sign_challenge_response(keypair: &Keypair, nonce: &[u8; 32]) -> Vec<u8> {
    let bytes = canonical_challenge_response_bytes(&keypair.peer_id(), nonce);
    sign_with_domain(keypair, CHALLENGE_SIGNATURE_DOMAIN, &bytes)
}

/// Initiator side: verify a `Welcome` attestation against the responder's
/// identity before trusting the session.
pub fn verify_attestation(
    attestation: &SessionAttestation,
    issuer: &PeerId,
    now: u64,
) -> Result<(), HandshakeError> {
    verify_with_domain(
        issuer,
        ATTEST_SIGNATURE_DOMAIN,
        &attestation.canonical_bytes(),
        &attestation.signature,
    )
    .map_err(HandshakeError::BadSignature)?;
    if attestation.is_expired(now) {
        return Err(HandshakeError::ChallengeExpired);
    }
    Ok(())
}

// ============================================================================
// Engine (pure responder-side state)
// ============================================================================

/// Responder-side handshake state: the bounded challenge cache plus the
/// book of live attestations. Owned by the handshake actor; pure logic so
/// the flood and expiry properties are unit-testable without a runtime.
pub struct HandshakeEngine {
    keypair: Keypair,
    challenges: LruCache<PeerId, Challenge>,
    attestations: LruCache<PeerId, SessionAttestation>,
    config: HandshakeConfig,
}

impl HandshakeEngine {
    pub fn new(keypair: Keypair, config: HandshakeConfig) -> Self {
        let challenge_cap = NonZeroUsize::new(config.challenge_cache_capacity.max(1))
            .expect("capacity is at least 1");
        let attest_cap =
            NonZeroUsize::new(MAX_LIVE_ATTESTATIONS).expect("MAX_LIVE_ATTESTATIONS is non-zero");
        Self {
            keypair,
            challenges: LruCache::new(challenge_cap),
            attestations: LruCache::new(attest_cap),
            config,
        }
    }

    /// Issue a challenge for a claimed identity and cache it.
    ///
    /// An invalid claimed key is rejected before a nonce is spent. Issuing
    /// a second challenge for the same peer replaces the first (only the
    /// latest is answerable).
    pub fn begin(&mut self, claimed: PeerId, now: u64) -> Result<Challenge, HandshakeError> {
        if !claimed.is_valid() {
            return Err(HandshakeError::InvalidIdentity);
        }
        let mut nonce = [0u8; 32];
        getrandom::getrandom(&mut nonce).map_err(|_| HandshakeError::Unavailable)?;
        let challenge = Challenge {
            nonce,
            issued_to: claimed,
            issued_at: now,
            expires_at: now + self.config.challenge_lifetime.as_millis() as u64,
        };
        self.challenges.put(claimed, challenge.clone());
        Ok(challenge)
    }

    /// Verify an `Attest` response. Consumes the pending challenge on every
    /// path — success or failure — so a failed attempt cannot be retried
    /// against the same nonce. Returns the decoded ticket (`None` when the
    /// peer presented none, which is only acceptable for a re-handshaking
    /// member); no table state is mutated here.
    pub fn verify_response(
        &mut self,
        claimed: PeerId,
        transport_identity: PeerId,
        nonce_signature: &[u8],
        ticket_bytes: &[u8],
        now: u64,
    ) -> Result<Option<Ticket>, HandshakeError> {
        let challenge = self
            .challenges
            .pop(&claimed)
            .ok_or(HandshakeError::NoChallenge)?;
        if challenge.is_expired(now) {
            return Err(HandshakeError::ChallengeExpired);
        }
        // Declared pubkey must be the key the transport authenticated.
        if claimed != transport_identity {
            return Err(HandshakeError::IdentityMismatch);
        }
        let bytes = canonical_challenge_response_bytes(&claimed, &challenge.nonce);
        verify_with_domain(
            &claimed,
            CHALLENGE_SIGNATURE_DOMAIN,
            &bytes,
            nonce_signature,
        )
        .map_err(HandshakeError::BadSignature)?;
        if ticket_bytes.is_empty() {
            return Ok(None);
        }
        // Ticket: hard byte ceiling inside decode, before structured parsing.
        Ticket::decode(ticket_bytes)
            .map(Some)
            .map_err(HandshakeError::Ticket)
    }

    /// Record a session for a responder we authenticated as initiator (its
    /// `Welcome` attestation verified against its transport identity). The
    /// marker carries no signature — it is local gate state, not wire data
    /// — and expires on the same schedule as issued attestations.
    pub fn admit_session(&mut self, peer: PeerId, now: u64) {
        self.attestations.put(
            peer,
            SessionAttestation {
                peer_id: peer,
                issued_at: now,
                expires_at: now + self.config.session_lifetime.as_millis() as u64,
                signature: Vec::new(),
            },
        );
    }

    /// Mint and record an attestation for a peer that passed every check.
    pub fn issue_attestation(&mut self, peer: PeerId, now: u64) -> SessionAttestation {
        let mut attestation = SessionAttestation {
            peer_id: peer,
            issued_at: now,
            expires_at: now + self.config.session_lifetime.as_millis() as u64,
            signature: Vec::new(),
        };
        attestation.signature = sign_with_domain(
            &self.keypair,
            ATTEST_SIGNATURE_DOMAIN,
            &attestation.canonical_bytes(),
        );
        self.attestations.put(peer, attestation.clone());
        attestation
    }

    /// Whether a peer holds a live attestation. This is the gate in front
    /// of every non-handshake frame.
    pub fn is_authenticated(&mut self, peer: &PeerId, now: u64) -> bool {
        match self.attestations.get(peer) {
            Some(att) if !att.is_expired(now) => true,
            Some(_) => {
                self.attestations.pop(peer);
                false
            }
            None => false,
        }
    }

    /// Drop a peer's attestation (ban, departure, disconnect).
    pub fn revoke(&mut self, peer: &PeerId) {
        self.attestations.pop(peer);
    }

    /// Periodic sweep: expired challenges and attestations are removed so
    /// neither table retains dead entries past the tick.
    pub fn sweep(&mut self, now: u64) {
        let expired: Vec<PeerId> = self
            .challenges
            .iter()
            .filter(|(_, c)| c.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.challenges.pop(&id);
        }
        let expired: Vec<PeerId> = self
            .attestations
            .iter()
            .filter(|(_, a)| a.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.attestations.pop(&id);
        }
    }

    pub fn pending_challenges(&self) -> usize {
        self.challenges.len()
    }

    pub fn live_attestations(&self) -> usize {
        self.attestations.len()
    }

    #[cfg(test)]
    fn oldest_challenge_peer(&self) -> Option<PeerId> {
        // LruCache iterates most-recent first.
        self.challenges.iter().last().map(|(id, _)| *id)
    }
}

// ============================================================================
// Actor
// ============================================================================

enum HandshakeCommand {
    Begin {
        claimed: PeerId,
        reply: oneshot::Sender<Result<Challenge, HandshakeError>>,
    },
    Complete {
        claimed: PeerId,
        transport_identity: PeerId,
        nonce_signature: Vec<u8>,
        ticket_bytes: Vec<u8>,
        reply: oneshot::Sender<Result<HandshakeOutcome, HandshakeError>>,
    },
    IsAuthenticated {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    AdmitSession {
        peer: PeerId,
    },
    Revoke {
        peer: PeerId,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

struct HandshakeActor {
    engine: HandshakeEngine,
    membership: Membership,
}

impl HandshakeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<HandshakeCommand>) {
        let mut sweep = tokio::time::interval(self.engine.config.sweep_interval);
        sweep.tick().await; // skip immediate tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(HandshakeCommand::Begin { claimed, reply }) => {
                            let _ = reply.send(self.engine.begin(claimed, now_ms()));
                        }
                        Some(HandshakeCommand::Complete {
                            claimed,
                            transport_identity,
                            nonce_signature,
                            ticket_bytes,
                            reply,
                        }) => {
                            let result = self
                                .complete(claimed, transport_identity, &nonce_signature, &ticket_bytes)
                                .await;
                            let _ = reply.send(result);
                        }
                        Some(HandshakeCommand::IsAuthenticated { peer, reply }) => {
                            let _ = reply.send(self.engine.is_authenticated(&peer, now_ms()));
                        }
                        Some(HandshakeCommand::AdmitSession { peer }) => {
                            self.engine.admit_session(peer, now_ms());
                        }
                        Some(HandshakeCommand::Revoke { peer }) => {
                            self.engine.revoke(&peer);
                        }
                        Some(HandshakeCommand::PendingCount { reply }) => {
                            let _ = reply.send(self.engine.pending_challenges());
                        }
                        Some(HandshakeCommand::Quit) | None => {
                            debug!("handshake actor shutting down");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.engine.sweep(now_ms());
                }
            }
        }
    }

    /// Full responder flow for an `Attest` frame: verify, admit, attest.
    /// Any failure leaves the membership table untouched (the challenge was
    /// consumed by `verify_response`, which is the intended eviction).
    ///
    /// A peer that already holds a membership record may re-handshake
    /// without a ticket; an unknown peer must present a valid one.
    async fn complete(
        &mut self,
        claimed: PeerId,
        transport_identity: PeerId,
        nonce_signature: &[u8],
        ticket_bytes: &[u8],
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let now = now_ms();
        let maybe_ticket = self.engine.verify_response(
            claimed,
            transport_identity,
            nonce_signature,
            ticket_bytes,
            now,
        )?;
        let (record, newly_joined) = match self.membership.get(claimed).await {
            Some(existing) => {
                self.membership.record_seen(claimed).await;
                (existing, false)
            }
            None => {
                let ticket = maybe_ticket.ok_or(HandshakeError::TicketRequired)?;
                let record = self
                    .membership
                    .admit_ticket(ticket, claimed)
                    .await
                    .map_err(HandshakeError::Ticket)?;
                (record, true)
            }
        };
        let attestation = self.engine.issue_attestation(claimed, now);
        info!(
            peer = %claimed.short_hex(),
            tier = %record.tier,
            rejoin = !newly_joined,
            expires_in_s = (attestation.expires_at.saturating_sub(now)) / 1_000,
            "handshake authenticated"
        );
        Ok(HandshakeOutcome {
            record,
            attestation,
            newly_joined,
        })
    }
}

/// Result of a successful responder-side handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub record: MembershipRecord,
    pub attestation: SessionAttestation,
    /// True when the peer was admitted fresh (ticket redeemed), false for
    /// a member re-handshake.
    pub newly_joined: bool,
}

/// Handle to the handshake actor.
#[derive(Clone)]
pub struct Handshake {
    cmd_tx: mpsc::Sender<HandshakeCommand>,
}

impl Handshake {
    pub fn spawn(keypair: Keypair, membership: Membership, config: HandshakeConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(HANDSHAKE_CHANNEL_SIZE);
        let actor = HandshakeActor {
            engine: HandshakeEngine::new(keypair, config),
            membership,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Responder: issue a challenge for a `Hello`.
    pub async fn begin(&self, claimed: PeerId) -> Result<Challenge, HandshakeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(HandshakeCommand::Begin { claimed, reply })
            .await
            .map_err(|_| HandshakeError::Unavailable)?;
        rx.await.unwrap_or(Err(HandshakeError::Unavailable))
    }

    /// Responder: process an `Attest` frame end to end.
    pub async fn complete(
        &self,
        claimed: PeerId,
        transport_identity: PeerId,
        nonce_signature: Vec<u8>,
        ticket_bytes: Vec<u8>,
    ) -> Result<HandshakeOutcome, HandshakeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(HandshakeCommand::Complete {
                claimed,
                transport_identity,
                nonce_signature,
                ticket_bytes,
                reply,
            })
            .await
            .map_err(|_| HandshakeError::Unavailable)?;
        rx.await.unwrap_or(Err(HandshakeError::Unavailable))
    }

    /// Gate check used by the frame dispatcher.
    pub async fn is_authenticated(&self, peer: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandshakeCommand::IsAuthenticated { peer, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Initiator side: open the gate for a responder whose `Welcome`
    /// attestation we verified.
    pub async fn admit_session(&self, peer: PeerId) {
        let _ = self
            .cmd_tx
            .send(HandshakeCommand::AdmitSession { peer })
            .await;
    }

    pub async fn revoke(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(HandshakeCommand::Revoke { peer }).await;
    }

    pub async fn pending_challenges(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(HandshakeCommand::PendingCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(HandshakeCommand::Quit).await;
    }
}
