//! # Membership, Tickets, and Promotion Governance
//!
//! The membership table is the hive's ground truth about who belongs and at
//! what tier. It uses the actor pattern: [`Membership`] is the cheap-to-clone
//! handle, `MembershipActor` owns the table and processes commands
//! sequentially, which is what makes the single-writer discipline hold —
//! only handshake admission and governance commands mutate the table, and
//! they all arrive through this one actor.
//!
//! ## Tiers
//!
//! | Tier | Rights |
//! |------|--------|
//! | Neophyte | probationary; may only request promotion |
//! | Member | vouches, bans, voting; full gossip participation |
//! | Admin | founding trust; everything a member can do |
//!
//! Tier transitions are monotonic (neophyte → member → admin) with two
//! terminal exits: ban (tombstoned, can never rejoin) and voluntary
//! departure (record removed, may rejoin with a fresh ticket).
//!
//! ## Tickets
//!
//! A [`Ticket`] is a bounded, signed, single-use invitation. Decoding
//! enforces the byte-length ceiling before any structured parsing, so an
//! oversized ticket is rejected in O(1). Used tickets are tracked in a
//! bounded set.
//!
//! ## Promotion Quorum
//!
//! `quorum = max(min_quorum, ceil(active_members × quorum_fraction))` where
//! "active" means a member seen within the configured recency window. All
//! three inputs are [`MembershipConfig`] fields, not protocol constants.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::crypto::{
    sign_with_domain, verify_with_domain, SignatureError, TICKET_SIGNATURE_DOMAIN,
    VOUCH_SIGNATURE_DOMAIN,
};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::wire::{VouchRecord, MAX_TICKET_BYTES};

// ============================================================================
// Bounds
// ============================================================================

/// Capacity of the used-ticket set.
/// SECURITY: bounds replay tracking; a ticket older than the eviction
/// horizon has long expired anyway.
const MAX_USED_TICKETS: usize = 4_096;

/// Capacity of the ban tombstone set.
const MAX_TOMBSTONES: usize = 4_096;

/// Concurrent promotion rounds tracked.
/// SECURITY: bounds vouch-tally memory against request_id churn.
const MAX_PROMOTION_ROUNDS: usize = 256;

/// Command channel capacity for the membership actor.
const MEMBERSHIP_CHANNEL_SIZE: usize = 256;

/// Tolerated clock skew on vouch timestamps, milliseconds.
const VOUCH_SKEW_MS: u64 = 5 * 60 * 1_000;

// ============================================================================
// Tiers and Records
// ============================================================================

/// Membership tier. Ordering reflects trust: `Neophyte < Member < Admin`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Tier {
    Neophyte,
    Member,
    Admin,
}

impl Tier {
    /// Only members and admins may emit vouches, bans, or tickets.
    pub fn can_vouch(&self) -> bool {
        matches!(self, Tier::Member | Tier::Admin)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Neophyte => write!(f, "neophyte"),
            Tier::Member => write!(f, "member"),
            Tier::Admin => write!(f, "admin"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub peer_id: PeerId,
    pub tier: Tier,
    pub joined_at: u64,
    pub last_seen: u64,
    pub vouch_count: u32,
}

// ============================================================================
// Tickets
// ============================================================================

/// Content-addressed ticket identifier used by the single-use tracking set.
pub type TicketId = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketError {
    /// Byte length exceeds [`MAX_TICKET_BYTES`]; rejected before parsing.
    Oversized { len: usize },
    /// Structured decode failed. Terminal — no partial ticket exists.
    Malformed,
    /// Past `expires_at`.
    Expired,
    /// Signature over the canonical ticket bytes does not verify.
    BadSignature(SignatureError),
    /// Issuer is unknown or below member tier.
    IssuerNotAuthorized,
    /// Ticket was already redeemed.
    AlreadyUsed,
    /// Ticket names a different invitee than the presenting peer.
    WrongInvitee,
}

impl std::fmt::Display for TicketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TicketError::Oversized { len } => {
                write!(f, "ticket of {} bytes exceeds {} byte ceiling", len, MAX_TICKET_BYTES)
            }
            TicketError::Malformed => write!(f, "malformed ticket"),
            TicketError::Expired => write!(f, "ticket expired"),
            TicketError::BadSignature(e) => write!(f, "ticket signature: {}", e),
            TicketError::IssuerNotAuthorized => write!(f, "ticket issuer not authorized"),
            TicketError::AlreadyUsed => write!(f, "ticket already used"),
            TicketError::WrongInvitee => write!(f, "ticket names a different invitee"),
        }
    }
}

impl std::error::Error for TicketError {}

/// A signed, bounded, single-use invitation credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub issuer: PeerId,
    pub invitee: PeerId,
    pub issued_at: u64,
    pub expires_at: u64,
    /// Signature by `issuer` over [`Ticket::canonical_bytes`].
    pub signature: Vec<u8>,
}

impl Ticket {
    /// Mint a ticket for `invitee`, valid for `validity`.
    pub fn issue(keypair: &Keypair, invitee: PeerId, validity: Duration) -> Self {
        let issued_at = now_ms();
        let mut ticket = Self {
            issuer: keypair.peer_id(),
            invitee,
            issued_at,
            expires_at: issued_at + validity.as_millis() as u64,
            signature: Vec::new(),
        };
        ticket.signature =
            sign_with_domain(keypair, TICKET_SIGNATURE_DOMAIN, &ticket.canonical_bytes());
        ticket
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + 32 + 8 + 8);
        out.extend_from_slice(self.issuer.as_bytes());
        out.extend_from_slice(self.invitee.as_bytes());
        out.extend_from_slice(&self.issued_at.to_le_bytes());
        out.extend_from_slice(&self.expires_at.to_le_bytes());
        out
    }

    /// Content address for the used-ticket set.
    pub fn id(&self) -> TicketId {
        *blake3::hash(&self.canonical_bytes()).as_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        crate::wire::serialize_payload(self).expect("ticket serialization is infallible")
    }

    /// Decode a ticket from raw bytes.
    ///
    /// The byte-length ceiling is checked FIRST — an oversized input is
    /// rejected by the length comparison alone, before any base decoding or
    /// structured parsing. Failure is terminal; there is no partial ticket.
    pub fn decode(bytes: &[u8]) -> Result<Self, TicketError> {
        if bytes.len() > MAX_TICKET_BYTES {
            return Err(TicketError::Oversized { len: bytes.len() });
        }
        let ticket: Ticket =
            crate::wire::deserialize_bounded(bytes).map_err(|_| TicketError::Malformed)?;
        if ticket.signature.len() != 64 {
            return Err(TicketError::Malformed);
        }
        Ok(ticket)
    }

    /// Signature and expiry checks. Issuer tier and single-use are table
    /// context and are checked by [`MembershipTable::admit_ticket`].
    pub fn verify(&self, now: u64) -> Result<(), TicketError> {
        verify_with_domain(
            &self.issuer,
            TICKET_SIGNATURE_DOMAIN,
            &self.canonical_bytes(),
            &self.signature,
        )
        .map_err(TicketError::BadSignature)?;
        if now >= self.expires_at {
            return Err(TicketError::Expired);
        }
        Ok(())
    }
}

// ============================================================================
// Vouches and Quorum
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// Sender is not a member (or not present at all).
    NotAMember,
    /// Target peer is unknown.
    TargetNotFound,
    /// Target is not a neophyte (promotion already happened, or admin).
    TargetNotNeophyte,
    /// Peer is tombstoned.
    Banned,
    /// Vouch `voucher` field differs from the authenticated frame sender.
    VouchIdentityMismatch,
    /// Vouch signature does not verify.
    BadSignature(SignatureError),
    /// Vouch timestamp is outside the tolerated skew window.
    StaleVouch,
}

impl std::fmt::Display for MembershipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipError::NotAMember => write!(f, "sender is not a member"),
            MembershipError::TargetNotFound => write!(f, "target peer unknown"),
            MembershipError::TargetNotNeophyte => write!(f, "target is not a neophyte"),
            MembershipError::Banned => write!(f, "peer is banned"),
            MembershipError::VouchIdentityMismatch => {
                write!(f, "voucher does not match authenticated sender")
            }
            MembershipError::BadSignature(e) => write!(f, "vouch signature: {}", e),
            MembershipError::StaleVouch => write!(f, "vouch timestamp out of window"),
        }
    }
}

impl std::error::Error for MembershipError {}

/// Outcome of tallying one vouch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VouchOutcome {
    /// Vouch recorded; quorum not yet reached.
    Recorded { tally: usize, quorum: usize },
    /// This vouch completed the quorum. Carries the full round for the
    /// promotion broadcast.
    QuorumReached {
        tally: usize,
        quorum: usize,
        vouches: Vec<VouchRecord>,
    },
    /// Same voucher already counted for this round; idempotent no-op.
    Duplicate,
}

/// Policy inputs for membership governance. These are configuration, not
/// protocol invariants.
#[derive(Clone, Debug)]
pub struct MembershipConfig {
    /// Absolute floor on the promotion quorum.
    pub min_quorum: usize,
    /// Fraction of active members required to vouch.
    pub quorum_fraction: f64,
    /// How recently a member must have been seen to count as active.
    pub active_window: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            min_quorum: 3,
            quorum_fraction: 0.51,
            active_window: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Sign a vouch for `target` in the promotion round `request_id`.
pub fn make_vouch(keypair: &Keypair, target: PeerId, request_id: [u8; 16]) -> VouchRecord {
    let mut vouch = VouchRecord {
        target,
        request_id,
        voucher: keypair.peer_id(),
        timestamp: now_ms(),
        signature: Vec::new(),
    };
    vouch.signature = sign_with_domain(keypair, VOUCH_SIGNATURE_DOMAIN, &vouch.canonical_bytes());
    vouch
}

// ============================================================================
// Membership Table (single writer: the membership actor)
// ============================================================================

struct PromotionRound {
    vouches: HashMap<PeerId, VouchRecord>,
}

pub struct MembershipTable {
    records: HashMap<PeerId, MembershipRecord>,
    /// Ban tombstones. Terminal: a tombstoned peer can never rejoin.
    banned: LruCache<PeerId, ()>,
    used_tickets: LruCache<TicketId, ()>,
    rounds: LruCache<(PeerId, [u8; 16]), PromotionRound>,
    config: MembershipConfig,
}

impl MembershipTable {
    pub fn new(config: MembershipConfig) -> Self {
        Self {
            records: HashMap::new(),
            banned: LruCache::new(NonZeroUsize::new(MAX_TOMBSTONES).expect("nonzero")),
            used_tickets: LruCache::new(NonZeroUsize::new(MAX_USED_TICKETS).expect("nonzero")),
            rounds: LruCache::new(NonZeroUsize::new(MAX_PROMOTION_ROUNDS).expect("nonzero")),
            config,
        }
    }

    /// Seed a founding admin. Used at hive genesis and when loading a
    /// persisted roster.
    pub fn seed_admin(&mut self, peer_id: PeerId, now: u64) {
        self.records.insert(
            peer_id,
            MembershipRecord {
                peer_id,
                tier: Tier::Admin,
                joined_at: now,
                last_seen: now,
                vouch_count: 0,
            },
        );
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&MembershipRecord> {
        self.records.get(peer_id)
    }

    pub fn is_banned(&self, peer_id: &PeerId) -> bool {
        self.banned.contains(peer_id)
    }

    /// Member-or-better, the gate for gossip and intent participation.
    pub fn is_member(&self, peer_id: &PeerId) -> bool {
        self.records
            .get(peer_id)
            .map(|r| r.tier.can_vouch())
            .unwrap_or(false)
    }

    /// Known at any tier (neophytes included).
    pub fn is_known(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn members(&self) -> Vec<MembershipRecord> {
        let mut out: Vec<_> = self.records.values().cloned().collect();
        out.sort_by_key(|r| r.peer_id);
        out
    }

    /// Members (not neophytes) seen within the active window.
    pub fn active_members(&self, now: u64) -> usize {
        let window = self.config.active_window.as_millis() as u64;
        self.records
            .values()
            .filter(|r| r.tier.can_vouch() && now.saturating_sub(r.last_seen) <= window)
            .count()
    }

    /// `max(min_quorum, ceil(active × fraction))`.
    pub fn quorum(&self, active: usize) -> usize {
        let fractional = (active as f64 * self.config.quorum_fraction).ceil() as usize;
        fractional.max(self.config.min_quorum)
    }

    /// Redeem a ticket presented by `invitee` during handshake, then record
    /// the join. The ticket is marked used only when every check passes, so
    /// a failed handshake never burns a ticket.
    pub fn admit_ticket(
        &mut self,
        ticket: &Ticket,
        invitee: PeerId,
        now: u64,
    ) -> Result<MembershipRecord, TicketError> {
        if self.is_banned(&invitee) {
            // Tombstoned peers cannot be re-invited.
            return Err(TicketError::IssuerNotAuthorized);
        }
        if ticket.invitee != invitee {
            return Err(TicketError::WrongInvitee);
        }
        ticket.verify(now)?;
        match self.records.get(&ticket.issuer) {
            Some(rec) if rec.tier.can_vouch() => {}
            _ => return Err(TicketError::IssuerNotAuthorized),
        }
        if self.used_tickets.contains(&ticket.id()) {
            return Err(TicketError::AlreadyUsed);
        }
        self.used_tickets.put(ticket.id(), ());

        let record = self
            .records
            .entry(invitee)
            .or_insert_with(|| MembershipRecord {
                peer_id: invitee,
                tier: Tier::Neophyte,
                joined_at: now,
                last_seen: now,
                vouch_count: 0,
            });
        record.last_seen = now;
        Ok(record.clone())
    }

    /// Record a successful re-handshake by an existing member (no ticket
    /// needed once admitted).
    pub fn record_seen(&mut self, peer_id: &PeerId, now: u64) {
        if let Some(record) = self.records.get_mut(peer_id) {
            record.last_seen = now;
        }
    }

    /// Tally a vouch. `authenticated_sender` is the transport-verified
    /// identity of the frame's origin; a vouch whose `voucher` field
    /// disagrees is rejected regardless of its inner signature.
    pub fn apply_vouch(
        &mut self,
        vouch: &VouchRecord,
        authenticated_sender: PeerId,
        now: u64,
    ) -> Result<VouchOutcome, MembershipError> {
        if vouch.voucher != authenticated_sender {
            return Err(MembershipError::VouchIdentityMismatch);
        }
        match self.records.get(&vouch.voucher) {
            Some(rec) if rec.tier.can_vouch() => {}
            _ => return Err(MembershipError::NotAMember),
        }
        match self.records.get(&vouch.target) {
            None => return Err(MembershipError::TargetNotFound),
            Some(rec) if rec.tier != Tier::Neophyte => {
                return Err(MembershipError::TargetNotNeophyte)
            }
            Some(_) => {}
        }
        verify_with_domain(
            &vouch.voucher,
            VOUCH_SIGNATURE_DOMAIN,
            &vouch.canonical_bytes(),
            &vouch.signature,
        )
        .map_err(MembershipError::BadSignature)?;
        if now.saturating_sub(vouch.timestamp).max(vouch.timestamp.saturating_sub(now))
            > VOUCH_SKEW_MS
        {
            return Err(MembershipError::StaleVouch);
        }

        let key = (vouch.target, vouch.request_id);
        if self.rounds.get(&key).is_none() {
            self.rounds.put(
                key,
                PromotionRound {
                    vouches: HashMap::new(),
                },
            );
        }
        let round = self.rounds.get_mut(&key).expect("round just inserted");
        if round.vouches.contains_key(&vouch.voucher) {
            return Ok(VouchOutcome::Duplicate);
        }
        round.vouches.insert(vouch.voucher, vouch.clone());
        let tally = round.vouches.len();

        let active = self.active_members(now);
        let quorum = self.quorum(active);
        if tally >= quorum {
            let vouches: Vec<VouchRecord> = self
                .rounds
                .pop(&key)
                .map(|r| r.vouches.into_values().collect())
                .unwrap_or_default();
            Ok(VouchOutcome::QuorumReached {
                tally,
                quorum,
                vouches,
            })
        } else {
            Ok(VouchOutcome::Recorded { tally, quorum })
        }
    }

    /// Promote a neophyte to member. Monotonic: promoting a member or admin
    /// is a no-op returning the current record.
    pub fn promote(
        &mut self,
        target: PeerId,
        vouch_count: u32,
    ) -> Result<MembershipRecord, MembershipError> {
        if self.is_banned(&target) {
            return Err(MembershipError::Banned);
        }
        let record = self
            .records
            .get_mut(&target)
            .ok_or(MembershipError::TargetNotFound)?;
        if record.tier == Tier::Neophyte {
            record.tier = Tier::Member;
            record.vouch_count = vouch_count;
        }
        Ok(record.clone())
    }

    /// Ban a peer. Terminal and idempotent: the record is removed and a
    /// tombstone prevents any future rejoin.
    pub fn ban(&mut self, target: PeerId) {
        self.records.remove(&target);
        self.banned.put(target, ());
    }

    /// Voluntary departure: record removed, no tombstone — the peer may
    /// rejoin later with a fresh ticket.
    pub fn depart(&mut self, peer_id: PeerId) {
        self.records.remove(&peer_id);
    }

    /// Merge roster records learned from a trusted peer (sync responses,
    /// join announcements). Tier moves are upward-only: a roster can
    /// introduce peers and report promotions, never demote or resurrect a
    /// banned peer. Returns how many records were added or upgraded.
    pub fn merge_roster(&mut self, roster: Vec<MembershipRecord>, now: u64) -> usize {
        let mut changed = 0;
        for incoming in roster {
            if self.is_banned(&incoming.peer_id) {
                continue;
            }
            match self.records.get_mut(&incoming.peer_id) {
                None => {
                    let mut record = incoming;
                    record.last_seen = record.last_seen.min(now);
                    self.records.insert(record.peer_id, record);
                    changed += 1;
                }
                Some(existing) if incoming.tier > existing.tier => {
                    existing.tier = incoming.tier;
                    existing.vouch_count = existing.vouch_count.max(incoming.vouch_count);
                    changed += 1;
                }
                Some(_) => {}
            }
        }
        changed
    }
}

// ============================================================================
// Actor
// ============================================================================

enum MembershipCommand {
    AdmitTicket {
        ticket: Ticket,
        invitee: PeerId,
        reply: oneshot::Sender<Result<MembershipRecord, TicketError>>,
    },
    RecordSeen {
        peer_id: PeerId,
    },
    ApplyVouch {
        vouch: VouchRecord,
        sender: PeerId,
        reply: oneshot::Sender<Result<VouchOutcome, MembershipError>>,
    },
    Promote {
        target: PeerId,
        vouch_count: u32,
        reply: oneshot::Sender<Result<MembershipRecord, MembershipError>>,
    },
    Ban {
        target: PeerId,
        reply: oneshot::Sender<()>,
    },
    Depart {
        peer_id: PeerId,
    },
    SeedAdmin {
        peer_id: PeerId,
    },
    MergeRoster {
        roster: Vec<MembershipRecord>,
        reply: oneshot::Sender<usize>,
    },
    IsMember {
        peer_id: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Get {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<MembershipRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<MembershipRecord>>,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
    QuorumNow {
        reply: oneshot::Sender<(usize, usize)>,
    },
    Quit,
}

struct MembershipActor {
    table: MembershipTable,
}

impl MembershipActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<MembershipCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                MembershipCommand::AdmitTicket {
                    ticket,
                    invitee,
                    reply,
                } => {
                    let result = self.table.admit_ticket(&ticket, invitee, now_ms());
                    match &result {
                        Ok(record) => info!(
                            peer = %invitee.short_hex(),
                            tier = %record.tier,
                            "peer admitted"
                        ),
                        Err(e) => debug!(peer = %invitee.short_hex(), error = %e, "admission refused"),
                    }
                    let _ = reply.send(result);
                }
                MembershipCommand::RecordSeen { peer_id } => {
                    self.table.record_seen(&peer_id, now_ms());
                }
                MembershipCommand::ApplyVouch {
                    vouch,
                    sender,
                    reply,
                } => {
                    let result = self.table.apply_vouch(&vouch, sender, now_ms());
                    if let Err(e) = &result {
                        debug!(
                            voucher = %vouch.voucher.short_hex(),
                            target = %vouch.target.short_hex(),
                            error = %e,
                            "vouch rejected"
                        );
                    }
                    let _ = reply.send(result);
                }
                MembershipCommand::Promote {
                    target,
                    vouch_count,
                    reply,
                } => {
                    let result = self.table.promote(target, vouch_count);
                    if result.is_ok() {
                        info!(peer = %target.short_hex(), "peer promoted to member");
                    }
                    let _ = reply.send(result);
                }
                MembershipCommand::Ban { target, reply } => {
                    warn!(peer = %target.short_hex(), "peer banned");
                    self.table.ban(target);
                    let _ = reply.send(());
                }
                MembershipCommand::Depart { peer_id } => {
                    info!(peer = %peer_id.short_hex(), "peer departed");
                    self.table.depart(peer_id);
                }
                MembershipCommand::SeedAdmin { peer_id } => {
                    self.table.seed_admin(peer_id, now_ms());
                }
                MembershipCommand::MergeRoster { roster, reply } => {
                    let changed = self.table.merge_roster(roster, now_ms());
                    if changed > 0 {
                        debug!(changed, "roster merged");
                    }
                    let _ = reply.send(changed);
                }
                MembershipCommand::IsMember { peer_id, reply } => {
                    let _ = reply.send(self.table.is_member(&peer_id));
                }
                MembershipCommand::Get { peer_id, reply } => {
                    let _ = reply.send(self.table.get(&peer_id).cloned());
                }
                MembershipCommand::Snapshot { reply } => {
                    let _ = reply.send(self.table.members());
                }
                MembershipCommand::ActiveCount { reply } => {
                    let _ = reply.send(self.table.active_members(now_ms()));
                }
                MembershipCommand::QuorumNow { reply } => {
                    let active = self.table.active_members(now_ms());
                    let _ = reply.send((active, self.table.quorum(active)));
                }
                MembershipCommand::Quit => {
                    debug!("membership actor shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle to the membership actor. Clones share the same underlying table.
#[derive(Clone)]
pub struct Membership {
    cmd_tx: mpsc::Sender<MembershipCommand>,
}

impl Membership {
    pub fn spawn(config: MembershipConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(MEMBERSHIP_CHANNEL_SIZE);
        let actor = MembershipActor {
            table: MembershipTable::new(config),
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    pub async fn admit_ticket(
        &self,
        ticket: Ticket,
        invitee: PeerId,
    ) -> Result<MembershipRecord, TicketError> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::AdmitTicket {
                ticket,
                invitee,
                reply,
            })
            .await
            .is_err()
        {
            return Err(TicketError::Malformed);
        }
        rx.await.unwrap_or(Err(TicketError::Malformed))
    }

    pub async fn record_seen(&self, peer_id: PeerId) {
        let _ = self
            .cmd_tx
            .send(MembershipCommand::RecordSeen { peer_id })
            .await;
    }

    pub async fn apply_vouch(
        &self,
        vouch: VouchRecord,
        sender: PeerId,
    ) -> Result<VouchOutcome, MembershipError> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::ApplyVouch {
                vouch,
                sender,
                reply,
            })
            .await
            .is_err()
        {
            return Err(MembershipError::NotAMember);
        }
        rx.await.unwrap_or(Err(MembershipError::NotAMember))
    }

    pub async fn promote(
        &self,
        target: PeerId,
        vouch_count: u32,
    ) -> Result<MembershipRecord, MembershipError> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::Promote {
                target,
                vouch_count,
                reply,
            })
            .await
            .is_err()
        {
            return Err(MembershipError::TargetNotFound);
        }
        rx.await.unwrap_or(Err(MembershipError::TargetNotFound))
    }

    pub async fn ban(&self, target: PeerId) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::Ban { target, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    pub async fn depart(&self, peer_id: PeerId) {
        let _ = self.cmd_tx.send(MembershipCommand::Depart { peer_id }).await;
    }

    pub async fn seed_admin(&self, peer_id: PeerId) {
        let _ = self
            .cmd_tx
            .send(MembershipCommand::SeedAdmin { peer_id })
            .await;
    }

    /// Merge roster records from a trusted source (sync response, join
    /// announcement). Upward-only; banned peers stay gone.
    pub async fn merge_roster(&self, roster: Vec<MembershipRecord>) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::MergeRoster { roster, reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Whether the peer holds a membership record at any tier.
    pub async fn is_known(&self, peer_id: PeerId) -> bool {
        self.get(peer_id).await.is_some()
    }

    pub async fn is_member(&self, peer_id: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::IsMember { peer_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn get(&self, peer_id: PeerId) -> Option<MembershipRecord> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(MembershipCommand::Get { peer_id, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn snapshot(&self) -> Vec<MembershipRecord> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn active_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::ActiveCount { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Current `(active_members, quorum)` pair.
    pub async fn quorum_now(&self) -> (usize, usize) {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(MembershipCommand::QuorumNow { reply })
            .await
            .is_err()
        {
            return (0, usize::MAX);
        }
        rx.await.unwrap_or((0, usize::MAX))
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(MembershipCommand::Quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_table() -> (MembershipTable, Keypair) {
        let mut table = MembershipTable::new(MembershipConfig::default());
        let admin = Keypair::generate();
        table.seed_admin(admin.peer_id(), now_ms());
        (table, admin)
    }

    fn admit(table: &mut MembershipTable, admin: &Keypair) -> Keypair {
        let invitee = Keypair::generate();
        let ticket = Ticket::issue(admin, invitee.peer_id(), Duration::from_secs(3600));
        table
            .admit_ticket(&ticket, invitee.peer_id(), now_ms())
            .expect("admission must succeed");
        invitee
    }

    #[test]
    fn ticket_round_trip() {
        let admin = Keypair::generate();
        let invitee = Keypair::generate();
        let ticket = Ticket::issue(&admin, invitee.peer_id(), Duration::from_secs(60));
        let decoded = Ticket::decode(&ticket.encode()).unwrap();
        assert_eq!(decoded, ticket);
        assert!(decoded.verify(now_ms()).is_ok());
    }

    #[test]
    fn oversized_ticket_rejected_by_length_check() {
        // 10x the ceiling; rejection must come from the length comparison,
        // not from parsing.
        let blob = vec![0u8; MAX_TICKET_BYTES * 10];
        assert_eq!(
            Ticket::decode(&blob),
            Err(TicketError::Oversized {
                len: MAX_TICKET_BYTES * 10
            })
        );
    }

    #[test]
    fn expired_ticket_rejected() {
        let admin = Keypair::generate();
        let invitee = Keypair::generate();
        let ticket = Ticket::issue(&admin, invitee.peer_id(), Duration::from_millis(0));
        assert_eq!(ticket.verify(now_ms() + 10), Err(TicketError::Expired));
    }

    #[test]
    fn tampered_ticket_rejected() {
        let admin = Keypair::generate();
        let invitee = Keypair::generate();
        let mut ticket = Ticket::issue(&admin, invitee.peer_id(), Duration::from_secs(60));
        ticket.expires_at += 1_000_000;
        assert!(matches!(
            ticket.verify(now_ms()),
            Err(TicketError::BadSignature(_))
        ));
    }

    #[test]
    fn ticket_single_use() {
        let (mut table, admin) = seeded_table();
        let invitee = Keypair::generate();
        let ticket = Ticket::issue(&admin, invitee.peer_id(), Duration::from_secs(3600));
        assert!(table
            .admit_ticket(&ticket, invitee.peer_id(), now_ms())
            .is_ok());
        assert_eq!(
            table.admit_ticket(&ticket, invitee.peer_id(), now_ms()),
            Err(TicketError::AlreadyUsed)
        );
    }

    #[test]
    fn ticket_from_neophyte_issuer_rejected() {
        let (mut table, admin) = seeded_table();
        let neophyte = admit(&mut table, &admin);
        let invitee = Keypair::generate();
        let ticket = Ticket::issue(&neophyte, invitee.peer_id(), Duration::from_secs(3600));
        assert_eq!(
            table.admit_ticket(&ticket, invitee.peer_id(), now_ms()),
            Err(TicketError::IssuerNotAuthorized)
        );
    }

    #[test]
    fn ticket_invitee_binding() {
        let (mut table, admin) = seeded_table();
        let invitee = Keypair::generate();
        let interloper = Keypair::generate();
        let ticket = Ticket::issue(&admin, invitee.peer_id(), Duration::from_secs(3600));
        assert_eq!(
            table.admit_ticket(&ticket, interloper.peer_id(), now_ms()),
            Err(TicketError::WrongInvitee)
        );
    }

    #[test]
    fn quorum_formula() {
        let table = MembershipTable::new(MembershipConfig::default());
        // Floor applies at small sizes.
        assert_eq!(table.quorum(0), 3);
        assert_eq!(table.quorum(4), 3);
        // ceil(10 * 0.51) = 6
        assert_eq!(table.quorum(10), 6);
        // ceil(100 * 0.51) = 51
        assert_eq!(table.quorum(100), 51);
    }

    #[test]
    fn vouch_identity_binding() {
        let (mut table, admin) = seeded_table();
        let neophyte = admit(&mut table, &admin);
        let vouch = make_vouch(&admin, neophyte.peer_id(), [1u8; 16]);
        // Authenticated sender differs from the vouch's voucher field:
        // rejected even though the inner signature is valid.
        let other = Keypair::generate();
        assert_eq!(
            table.apply_vouch(&vouch, other.peer_id(), now_ms()),
            Err(MembershipError::VouchIdentityMismatch)
        );
        // Matching sender is accepted.
        assert!(table
            .apply_vouch(&vouch, admin.peer_id(), now_ms())
            .is_ok());
    }

    #[test]
    fn vouch_from_neophyte_rejected() {
        let (mut table, admin) = seeded_table();
        let neophyte_a = admit(&mut table, &admin);
        let neophyte_b = admit(&mut table, &admin);
        let vouch = make_vouch(&neophyte_a, neophyte_b.peer_id(), [1u8; 16]);
        assert_eq!(
            table.apply_vouch(&vouch, neophyte_a.peer_id(), now_ms()),
            Err(MembershipError::NotAMember)
        );
    }

    #[test]
    fn duplicate_vouch_is_idempotent() {
        let (mut table, admin) = seeded_table();
        let neophyte = admit(&mut table, &admin);
        let vouch = make_vouch(&admin, neophyte.peer_id(), [2u8; 16]);
        assert!(matches!(
            table.apply_vouch(&vouch, admin.peer_id(), now_ms()),
            Ok(VouchOutcome::Recorded { tally: 1, .. })
        ));
        assert_eq!(
            table.apply_vouch(&vouch, admin.peer_id(), now_ms()),
            Ok(VouchOutcome::Duplicate)
        );
    }

    #[test]
    fn vouch_replay_across_rounds_has_distinct_signatures() {
        let admin = Keypair::generate();
        let target = PeerId::from_bytes([7u8; 32]);
        let vouch_round_1 = make_vouch(&admin, target, [1u8; 16]);
        let mut forged = vouch_round_1.clone();
        forged.request_id = [2u8; 16];
        // The signature covers request_id: moving a vouch to another round
        // invalidates it.
        assert!(verify_with_domain(
            &forged.voucher,
            VOUCH_SIGNATURE_DOMAIN,
            &forged.canonical_bytes(),
            &forged.signature
        )
        .is_err());
    }

    #[test]
    fn quorum_reached_promotes_with_enough_vouches() {
        let mut config = MembershipConfig::default();
        config.min_quorum = 2;
        let mut table = MembershipTable::new(config);
        let admin_a = Keypair::generate();
        let admin_b = Keypair::generate();
        table.seed_admin(admin_a.peer_id(), now_ms());
        table.seed_admin(admin_b.peer_id(), now_ms());
        let neophyte = {
            let invitee = Keypair::generate();
            let ticket = Ticket::issue(&admin_a, invitee.peer_id(), Duration::from_secs(3600));
            table
                .admit_ticket(&ticket, invitee.peer_id(), now_ms())
                .unwrap();
            invitee
        };

        let request_id = [3u8; 16];
        let v1 = make_vouch(&admin_a, neophyte.peer_id(), request_id);
        assert!(matches!(
            table.apply_vouch(&v1, admin_a.peer_id(), now_ms()),
            Ok(VouchOutcome::Recorded { .. })
        ));
        let v2 = make_vouch(&admin_b, neophyte.peer_id(), request_id);
        let outcome = table.apply_vouch(&v2, admin_b.peer_id(), now_ms()).unwrap();
        let vouches = match outcome {
            VouchOutcome::QuorumReached { tally, vouches, .. } => {
                assert_eq!(tally, 2);
                vouches
            }
            other => panic!("expected quorum, got {:?}", other),
        };
        assert_eq!(vouches.len(), 2);

        let record = table.promote(neophyte.peer_id(), 2).unwrap();
        assert_eq!(record.tier, Tier::Member);
    }

    #[test]
    fn promotion_is_monotonic() {
        let (mut table, _admin) = seeded_table();
        let peer = {
            let kp = Keypair::generate();
            table.seed_admin(kp.peer_id(), now_ms());
            kp.peer_id()
        };
        // Promoting an admin must not demote them.
        let record = table.promote(peer, 5).unwrap();
        assert_eq!(record.tier, Tier::Admin);
    }

    #[test]
    fn ban_is_terminal_and_idempotent() {
        let (mut table, admin) = seeded_table();
        let neophyte = admit(&mut table, &admin);
        table.ban(neophyte.peer_id());
        assert!(!table.is_known(&neophyte.peer_id()));
        assert!(table.is_banned(&neophyte.peer_id()));
        table.ban(neophyte.peer_id());
        assert!(table.is_banned(&neophyte.peer_id()));

        // A fresh ticket cannot resurrect a banned peer.
        let ticket = Ticket::issue(&admin, neophyte.peer_id(), Duration::from_secs(3600));
        assert!(table
            .admit_ticket(&ticket, neophyte.peer_id(), now_ms())
            .is_err());
    }

    #[test]
    fn departure_allows_rejoin() {
        let (mut table, admin) = seeded_table();
        let neophyte = admit(&mut table, &admin);
        table.depart(neophyte.peer_id());
        assert!(!table.is_known(&neophyte.peer_id()));
        let ticket = Ticket::issue(&admin, neophyte.peer_id(), Duration::from_secs(3600));
        assert!(table
            .admit_ticket(&ticket, neophyte.peer_id(), now_ms())
            .is_ok());
    }

    #[test]
    fn active_member_window() {
        let mut config = MembershipConfig::default();
        config.active_window = Duration::from_millis(1_000);
        let mut table = MembershipTable::new(config);
        let now = now_ms();
        let fresh = Keypair::generate().peer_id();
        let stale = Keypair::generate().peer_id();
        table.seed_admin(fresh, now);
        table.seed_admin(stale, now);
        table.record_seen(&stale, now.saturating_sub(10_000));
        // Manually age the stale record.
        if let Some(rec) = table.records.get_mut(&stale) {
            rec.last_seen = now.saturating_sub(10_000);
        }
        assert_eq!(table.active_members(now), 1);
    }

    #[tokio::test]
    async fn actor_round_trip() {
        let membership = Membership::spawn(MembershipConfig::default());
        let admin = Keypair::generate();
        membership.seed_admin(admin.peer_id()).await;
        assert!(membership.is_member(admin.peer_id()).await);

        let invitee = Keypair::generate();
        let ticket = Ticket::issue(&admin, invitee.peer_id(), Duration::from_secs(3600));
        let record = membership
            .admit_ticket(ticket, invitee.peer_id())
            .await
            .unwrap();
        assert_eq!(record.tier, Tier::Neophyte);
        assert!(!membership.is_member(invitee.peer_id()).await);
        assert_eq!(membership.snapshot().await.len(), 2);
        membership.quit().await;
    }
}
