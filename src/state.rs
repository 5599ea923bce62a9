//! # State Manager (Gossip Core)
//!
//! Maintains the node's view of fleet-wide shared facts — the **HiveMap** —
//! one signed [`StateEntry`] per known peer, and keeps it eventually
//! consistent across the fleet:
//!
//! - **Push**: on a jittered interval, broadcast fresh locally-known
//!   entries to authenticated peers.
//! - **Full sync**: answer digest requests with entries strictly newer than
//!   what the requester holds, hard-capped per response. Requests from
//!   non-members are rejected outright — accepting them would let an
//!   unauthenticated peer pollute the map and corrupt derived aggregates.
//! - **Merge**: last-writer-wins by version, monotonic, order-independent.
//!   An entry is accepted iff its version is strictly newer than the stored
//!   one, its subject is a currently-verified member, and its signature
//!   verifies against the subject's key. Equal versions are discarded.
//! - **Anti-entropy**: a compact per-peer version digest is exchanged
//!   before payloads, bounding reconciliation to changed rows.
//!
//! The actor owns the map; no other component writes state entries. Frame
//! decode and signature verification happen before commands reach the
//! actor's mailbox or inside pure helpers — never across a network await.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::crypto::{sign_with_domain, verify_with_domain, STATE_ENTRY_SIGNATURE_DOMAIN};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::membership::Membership;
use crate::protocols::HiveBroadcast;
use crate::wire::{
    DigestRow, Frame, FramePayload, PeerProfile, StateEntry, MAX_PUSH_ENTRIES, MAX_SYNC_ENTRIES,
};

// ============================================================================
// Bounds
// ============================================================================

/// Byte budget for the entry portion of one full-sync response; the
/// roster (capped separately) and envelope fit in the remaining headroom
/// under the frame ceiling.
const MAX_SYNC_RESPONSE_BYTES: usize = 32 * 1024;

/// Senders tracked by the rate limiter.
/// SECURITY: bounds the limiter itself against identity churn.
const MAX_RATE_LIMIT_SENDERS: usize = 1_024;

/// Command channel capacity for the state actor.
const STATE_CHANNEL_SIZE: usize = 256;

/// Fixed per-entry overhead estimate for the sync byte budget (serde
/// framing, signature, vec headers).
const ENTRY_OVERHEAD_BYTES: usize = 96;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct StateConfig {
    /// Base interval between gossip pushes.
    pub push_interval: Duration,
    /// Uniform jitter applied to each push interval (± this much).
    pub push_jitter: Duration,
    /// Cap on entries per full-sync response.
    pub max_sync_entries: usize,
    /// Entries accepted per sender per rate-limit window.
    pub per_sender_rate_limit: usize,
    /// Sliding window for the per-sender rate limit.
    pub rate_limit_window: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(300),
            push_jitter: Duration::from_secs(30),
            max_sync_entries: MAX_SYNC_ENTRIES,
            per_sender_rate_limit: 128,
            rate_limit_window: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Merge Outcomes
// ============================================================================

/// Per-entry merge result. Rejections are expected traffic, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Entry replaced the stored row (or created it).
    Applied,
    /// Equal version: discarded, idempotent.
    IgnoredEqual,
    /// Older version: replay or out-of-order duplicate, discarded.
    IgnoredStale,
    /// Entry's subject is not a verified member.
    RejectedNonMember,
    /// Signature over the canonical entry bytes failed.
    RejectedBadSignature,
}

/// Why a full-sync request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Requester is not a verified member. The canonical gating failure:
    /// non-member sync traffic never touches the map.
    NotAMember,
    /// Engine unavailable (shutting down).
    Unavailable,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::NotAMember => write!(f, "full sync refused: requester is not a member"),
            SyncError::Unavailable => write!(f, "state manager unavailable"),
        }
    }
}

impl std::error::Error for SyncError {}

// ============================================================================
// HiveMap (pure)
// ============================================================================

/// The shared-state map: one row per peer, merged last-writer-wins by
/// version. Pure logic; the actor is its only writer.
pub struct HiveMap {
    entries: HashMap<PeerId, StateEntry>,
    /// Peers whose rows changed since the last push.
    dirty: HashSet<PeerId>,
}

impl HiveMap {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    /// Merge one entry whose subject has already been membership-checked.
    /// Signature verification happens here so no caller can skip it.
    pub fn apply_verified_member(&mut self, entry: StateEntry) -> MergeOutcome {
        if verify_with_domain(
            &entry.peer_id,
            STATE_ENTRY_SIGNATURE_DOMAIN,
            &entry.canonical_bytes(),
            &entry.signature,
        )
        .is_err()
        {
            return MergeOutcome::RejectedBadSignature;
        }
        match self.entries.get(&entry.peer_id) {
            Some(stored) if entry.version < stored.version => MergeOutcome::IgnoredStale,
            Some(stored) if entry.version == stored.version => MergeOutcome::IgnoredEqual,
            _ => {
                self.dirty.insert(entry.peer_id);
                self.entries.insert(entry.peer_id, entry);
                MergeOutcome::Applied
            }
        }
    }

    /// Insert our own freshly-signed row, bypassing the member check (we
    /// are always a valid subject for our own entry).
    pub fn put_local(&mut self, entry: StateEntry) {
        self.dirty.insert(entry.peer_id);
        self.entries.insert(entry.peer_id, entry);
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&StateEntry> {
        self.entries.get(peer_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove a row (ban or departure).
    pub fn remove(&mut self, peer_id: &PeerId) {
        self.entries.remove(peer_id);
        self.dirty.remove(peer_id);
    }

    /// Compact per-peer version vector for anti-entropy.
    pub fn digest(&self) -> Vec<DigestRow> {
        let mut rows: Vec<DigestRow> = self
            .entries
            .values()
            .map(|e| DigestRow {
                peer_id: e.peer_id,
                version: e.version,
            })
            .collect();
        rows.sort_by_key(|r| r.peer_id);
        rows
    }

    /// Entries strictly newer than the requester's digest, capped by count
    /// and by byte budget so the response always fits one frame.
    pub fn entries_newer_than(&self, digest: &[DigestRow], max_entries: usize) -> Vec<StateEntry> {
        let known: HashMap<PeerId, u64> =
            digest.iter().map(|row| (row.peer_id, row.version)).collect();
        let mut out = Vec::new();
        let mut budget = MAX_SYNC_RESPONSE_BYTES;
        let mut candidates: Vec<&StateEntry> = self
            .entries
            .values()
            .filter(|e| match known.get(&e.peer_id) {
                Some(theirs) => e.version > *theirs,
                None => true,
            })
            .collect();
        // Deterministic order so repeated requests page consistently.
        candidates.sort_by_key(|e| e.peer_id);
        for entry in candidates {
            if out.len() >= max_entries {
                break;
            }
            let cost = entry.canonical_bytes().len() + ENTRY_OVERHEAD_BYTES;
            if cost > budget {
                break;
            }
            budget -= cost;
            out.push(entry.clone());
        }
        out
    }

    /// Drain the dirty set into push-sized batches of current rows.
    pub fn take_fresh(&mut self, max: usize) -> Vec<StateEntry> {
        let mut ids: Vec<PeerId> = self.dirty.iter().copied().collect();
        ids.sort();
        ids.truncate(max);
        for id in &ids {
            self.dirty.remove(id);
        }
        ids.iter()
            .filter_map(|id| self.entries.get(id).cloned())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<StateEntry> {
        let mut out: Vec<_> = self.entries.values().cloned().collect();
        out.sort_by_key(|e| e.peer_id);
        out
    }

    /// Derived aggregate: total advertised routing capacity of the fleet.
    /// This is the figure non-member sync gating protects.
    pub fn total_capacity_msat(&self) -> u64 {
        self.entries
            .values()
            .map(|e| e.profile.capacity_msat)
            .fold(0u64, u64::saturating_add)
    }
}

impl Default for HiveMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Build and sign our own state entry. Version is strictly increasing even
/// if the clock stalls between updates.
pub fn sign_local_entry(
    keypair: &Keypair,
    profile: PeerProfile,
    previous_version: Option<u64>,
) -> StateEntry {
    let version = now_ms().max(previous_version.map(|v| v + 1).unwrap_or(0));
    let mut entry = StateEntry {
        peer_id: keypair.peer_id(),
        version,
        profile,
        signature: Vec::new(),
    };
    entry.signature = sign_with_domain(
        keypair,
        STATE_ENTRY_SIGNATURE_DOMAIN,
        &entry.canonical_bytes(),
    );
    entry
}

// ============================================================================
// Per-Sender Rate Limiting
// ============================================================================

/// Sliding-window entry counter per sender, itself bounded.
struct SenderRateLimiter {
    windows: LruCache<PeerId, VecDeque<u64>>,
    limit: usize,
    window_ms: u64,
}

impl SenderRateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: LruCache::new(NonZeroUsize::new(MAX_RATE_LIMIT_SENDERS).expect("nonzero")),
            limit,
            window_ms: window.as_millis() as u64,
        }
    }

    /// Try to account `count` entries from `sender`. Returns how many are
    /// admitted before the limit cuts off.
    fn admit(&mut self, sender: PeerId, count: usize, now: u64) -> usize {
        if self.windows.get(&sender).is_none() {
            self.windows.put(sender, VecDeque::new());
        }
        let window = self.windows.get_mut(&sender).expect("window just inserted");
        while let Some(front) = window.front() {
            if now.saturating_sub(*front) > self.window_ms {
                window.pop_front();
            } else {
                break;
            }
        }
        let room = self.limit.saturating_sub(window.len());
        let admitted = count.min(room);
        for _ in 0..admitted {
            window.push_back(now);
        }
        admitted
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Summary of one processed push frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushReport {
    pub applied: usize,
    pub ignored: usize,
    pub rejected: usize,
    pub rate_limited: usize,
}

enum StateCommand {
    ApplyPush {
        entries: Vec<StateEntry>,
        sender: PeerId,
        reply: oneshot::Sender<PushReport>,
    },
    HandleSyncRequest {
        digest: Vec<DigestRow>,
        requester: PeerId,
        reply: oneshot::Sender<Result<Vec<StateEntry>, SyncError>>,
    },
    ApplySync {
        entries: Vec<StateEntry>,
        sender: PeerId,
        reply: oneshot::Sender<PushReport>,
    },
    UpdateLocal {
        profile: PeerProfile,
        reply: oneshot::Sender<StateEntry>,
    },
    Digest {
        reply: oneshot::Sender<Vec<DigestRow>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<StateEntry>>,
    },
    Get {
        peer_id: PeerId,
        reply: oneshot::Sender<Option<StateEntry>>,
    },
    Remove {
        peer_id: PeerId,
    },
    TotalCapacity {
        reply: oneshot::Sender<u64>,
    },
    Quit,
}

struct StateActor<R: HiveBroadcast> {
    map: HiveMap,
    keypair: Keypair,
    membership: Membership,
    rpc: Arc<R>,
    limiter: SenderRateLimiter,
    config: StateConfig,
}

impl<R: HiveBroadcast> StateActor<R> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<StateCommand>) {
        let push_sleep = tokio::time::sleep(self.jittered_push_interval());
        tokio::pin!(push_sleep);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(StateCommand::ApplyPush { entries, sender, reply }) => {
                            let report = self.apply_push(entries, sender).await;
                            let _ = reply.send(report);
                        }
                        Some(StateCommand::HandleSyncRequest { digest, requester, reply }) => {
                            let result = self.handle_sync_request(digest, requester).await;
                            let _ = reply.send(result);
                        }
                        Some(StateCommand::ApplySync { entries, sender, reply }) => {
                            let report = self.apply_entries(entries, sender).await;
                            let _ = reply.send(report);
                        }
                        Some(StateCommand::UpdateLocal { profile, reply }) => {
                            let previous = self
                                .map
                                .get(&self.keypair.peer_id())
                                .map(|e| e.version);
                            let entry = sign_local_entry(&self.keypair, profile, previous);
                            self.map.put_local(entry.clone());
                            let _ = reply.send(entry);
                        }
                        Some(StateCommand::Digest { reply }) => {
                            let _ = reply.send(self.map.digest());
                        }
                        Some(StateCommand::Snapshot { reply }) => {
                            let _ = reply.send(self.map.snapshot());
                        }
                        Some(StateCommand::Get { peer_id, reply }) => {
                            let _ = reply.send(self.map.get(&peer_id).cloned());
                        }
                        Some(StateCommand::Remove { peer_id }) => {
                            self.map.remove(&peer_id);
                        }
                        Some(StateCommand::TotalCapacity { reply }) => {
                            let _ = reply.send(self.map.total_capacity_msat());
                        }
                        Some(StateCommand::Quit) | None => {
                            debug!("state actor shutting down");
                            break;
                        }
                    }
                }
                _ = &mut push_sleep => {
                    self.push_fresh().await;
                    push_sleep.as_mut().reset(
                        tokio::time::Instant::now() + self.jittered_push_interval(),
                    );
                }
            }
        }
    }

    fn jittered_push_interval(&self) -> Duration {
        let base = self.config.push_interval;
        let jitter_ms = self.config.push_jitter.as_millis() as i64;
        if jitter_ms == 0 {
            return base;
        }
        let offset = rand::thread_rng().gen_range(-jitter_ms..=jitter_ms);
        let total = base.as_millis() as i64 + offset;
        Duration::from_millis(total.max(1_000) as u64)
    }

    /// Merge a push frame's entries. The frame-level sender was already
    /// authenticated and membership-gated by the dispatcher; each entry's
    /// subject is membership-checked here before merge. Unsolicited pushes
    /// are rate-limited per sender.
    async fn apply_push(&mut self, entries: Vec<StateEntry>, sender: PeerId) -> PushReport {
        let now = now_ms();
        let admitted = self.limiter.admit(sender, entries.len(), now);
        let rate_limited = entries.len() - admitted;
        if rate_limited > 0 {
            debug!(
                sender = %sender.short_hex(),
                dropped = rate_limited,
                "per-sender rate limit trimmed push"
            );
        }
        let mut report = self
            .apply_entries(entries.into_iter().take(admitted).collect(), sender)
            .await;
        report.rate_limited = rate_limited;
        report
    }

    /// Merge entries without rate limiting (responses to our own sync
    /// requests — traffic we asked for).
    async fn apply_entries(&mut self, entries: Vec<StateEntry>, sender: PeerId) -> PushReport {
        let mut report = PushReport::default();
        for entry in entries {
            // Entries about peers with no membership record never enter the
            // map, whoever carried them.
            if !self.membership.is_known(entry.peer_id).await {
                report.rejected += 1;
                continue;
            }
            match self.map.apply_verified_member(entry) {
                MergeOutcome::Applied => report.applied += 1,
                MergeOutcome::IgnoredEqual | MergeOutcome::IgnoredStale => report.ignored += 1,
                MergeOutcome::RejectedNonMember | MergeOutcome::RejectedBadSignature => {
                    report.rejected += 1
                }
            }
        }
        trace!(
            applied = report.applied,
            ignored = report.ignored,
            rejected = report.rejected,
            sender = %sender.short_hex(),
            "entries merged"
        );
        report
    }

    async fn handle_sync_request(
        &mut self,
        digest: Vec<DigestRow>,
        requester: PeerId,
    ) -> Result<Vec<StateEntry>, SyncError> {
        // Canonical gating: a full-sync request from a peer with no
        // membership record is rejected outright, before the map is
        // consulted.
        if !self.membership.is_known(requester).await {
            debug!(requester = %requester.short_hex(), "full sync refused: not a member");
            return Err(SyncError::NotAMember);
        }
        let entries = self
            .map
            .entries_newer_than(&digest, self.config.max_sync_entries);
        debug!(
            requester = %requester.short_hex(),
            entries = entries.len(),
            "answering full sync"
        );
        Ok(entries)
    }

    /// Periodic push: broadcast dirty rows to authenticated peers.
    async fn push_fresh(&mut self) {
        let entries = self.map.take_fresh(MAX_PUSH_ENTRIES);
        if entries.is_empty() {
            return;
        }
        info!(entries = entries.len(), "gossip push");
        let frame = Frame::signed(FramePayload::GossipPush { entries }, &self.keypair);
        if let Err(e) = self.rpc.broadcast(frame).await {
            debug!(error = %e, "gossip push broadcast failed");
        }
    }
}

/// Handle to the state manager actor.
#[derive(Clone)]
pub struct StateManager {
    cmd_tx: mpsc::Sender<StateCommand>,
}

impl StateManager {
    pub fn spawn<R: HiveBroadcast>(
        keypair: Keypair,
        membership: Membership,
        rpc: Arc<R>,
        config: StateConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(STATE_CHANNEL_SIZE);
        let limiter =
            SenderRateLimiter::new(config.per_sender_rate_limit, config.rate_limit_window);
        let actor = StateActor {
            map: HiveMap::new(),
            keypair,
            membership,
            rpc,
            limiter,
            config,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Merge entries from an authenticated member's push frame.
    pub async fn apply_push(&self, entries: Vec<StateEntry>, sender: PeerId) -> PushReport {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StateCommand::ApplyPush {
                entries,
                sender,
                reply,
            })
            .await
            .is_err()
        {
            return PushReport::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Answer a full-sync request (membership-gated).
    pub async fn handle_sync_request(
        &self,
        digest: Vec<DigestRow>,
        requester: PeerId,
    ) -> Result<Vec<StateEntry>, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StateCommand::HandleSyncRequest {
                digest,
                requester,
                reply,
            })
            .await
            .map_err(|_| SyncError::Unavailable)?;
        rx.await.unwrap_or(Err(SyncError::Unavailable))
    }

    /// Merge entries from a full-sync response we requested (no rate
    /// limiting — bounded instead by the response cap).
    pub async fn apply_sync(&self, entries: Vec<StateEntry>, sender: PeerId) -> PushReport {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StateCommand::ApplySync {
                entries,
                sender,
                reply,
            })
            .await
            .is_err()
        {
            return PushReport::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Re-sign and store our own profile; returns the new entry for
    /// immediate broadcast.
    pub async fn update_local(&self, profile: PeerProfile) -> Option<StateEntry> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StateCommand::UpdateLocal { profile, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub async fn digest(&self) -> Vec<DigestRow> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(StateCommand::Digest { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn snapshot(&self) -> Vec<StateEntry> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StateCommand::Snapshot { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn get(&self, peer_id: PeerId) -> Option<StateEntry> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(StateCommand::Get { peer_id, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Drop a row after a ban or departure.
    pub async fn remove(&self, peer_id: PeerId) {
        let _ = self.cmd_tx.send(StateCommand::Remove { peer_id }).await;
    }

    pub async fn total_capacity_msat(&self) -> u64 {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(StateCommand::TotalCapacity { reply })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(StateCommand::Quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipConfig;
    use crate::protocols::testing::RecordingRpc;

    fn profile(capacity: u64) -> PeerProfile {
        PeerProfile {
            capacity_msat: capacity,
            fee_base_msat: 1_000,
            fee_rate_ppm: 100,
            uptime_ppm: 999_000,
            addrs: vec!["198.51.100.4:9735".into()],
            topology_hints: vec![],
        }
    }

    fn entry_for(keypair: &Keypair, version: u64, capacity: u64) -> StateEntry {
        let mut entry = StateEntry {
            peer_id: keypair.peer_id(),
            version,
            profile: profile(capacity),
            signature: Vec::new(),
        };
        entry.signature = sign_with_domain(
            keypair,
            STATE_ENTRY_SIGNATURE_DOMAIN,
            &entry.canonical_bytes(),
        );
        entry
    }

    #[test]
    fn merge_applies_newer_versions() {
        let mut map = HiveMap::new();
        let kp = Keypair::generate();
        assert_eq!(
            map.apply_verified_member(entry_for(&kp, 1, 100)),
            MergeOutcome::Applied
        );
        assert_eq!(
            map.apply_verified_member(entry_for(&kp, 2, 200)),
            MergeOutcome::Applied
        );
        assert_eq!(map.get(&kp.peer_id()).unwrap().profile.capacity_msat, 200);
    }

    #[test]
    fn merge_is_monotonic_and_order_independent() {
        let kp = Keypair::generate();
        let a = entry_for(&kp, 1, 100);
        let b = entry_for(&kp, 2, 200);

        // a then b
        let mut map_1 = HiveMap::new();
        map_1.apply_verified_member(a.clone());
        map_1.apply_verified_member(b.clone());
        // b then a
        let mut map_2 = HiveMap::new();
        map_2.apply_verified_member(b.clone());
        assert_eq!(
            map_2.apply_verified_member(a.clone()),
            MergeOutcome::IgnoredStale
        );

        assert_eq!(map_1.get(&kp.peer_id()), map_2.get(&kp.peer_id()));
        assert_eq!(map_1.get(&kp.peer_id()).unwrap().version, 2);
    }

    #[test]
    fn merge_discards_equal_versions() {
        let mut map = HiveMap::new();
        let kp = Keypair::generate();
        let entry = entry_for(&kp, 5, 100);
        assert_eq!(
            map.apply_verified_member(entry.clone()),
            MergeOutcome::Applied
        );
        assert_eq!(map.apply_verified_member(entry), MergeOutcome::IgnoredEqual);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn merge_rejects_bad_signature() {
        let mut map = HiveMap::new();
        let kp = Keypair::generate();
        let mut entry = entry_for(&kp, 1, 100);
        entry.profile.capacity_msat = 999_999;
        assert_eq!(
            map.apply_verified_member(entry),
            MergeOutcome::RejectedBadSignature
        );
        assert!(map.is_empty());
    }

    #[test]
    fn merge_rejects_forged_subject() {
        let mut map = HiveMap::new();
        let victim = Keypair::generate();
        let forger = Keypair::generate();
        // Forger signs an entry claiming to be the victim.
        let mut entry = StateEntry {
            peer_id: victim.peer_id(),
            version: 10,
            profile: profile(1),
            signature: Vec::new(),
        };
        entry.signature = sign_with_domain(
            &forger,
            STATE_ENTRY_SIGNATURE_DOMAIN,
            &entry.canonical_bytes(),
        );
        assert_eq!(
            map.apply_verified_member(entry),
            MergeOutcome::RejectedBadSignature
        );
    }

    #[test]
    fn digest_and_newer_than() {
        let mut map = HiveMap::new();
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        map.apply_verified_member(entry_for(&kp_a, 3, 100));
        map.apply_verified_member(entry_for(&kp_b, 7, 200));

        let digest = map.digest();
        assert_eq!(digest.len(), 2);

        // Requester already has a's row at version 3 but b's at version 5.
        let request_digest = vec![
            DigestRow {
                peer_id: kp_a.peer_id(),
                version: 3,
            },
            DigestRow {
                peer_id: kp_b.peer_id(),
                version: 5,
            },
        ];
        let newer = map.entries_newer_than(&request_digest, 500);
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].peer_id, kp_b.peer_id());
    }

    #[test]
    fn sync_response_cap_enforced() {
        let mut map = HiveMap::new();
        let mut keys = Vec::new();
        for _ in 0..20 {
            let kp = Keypair::generate();
            map.apply_verified_member(entry_for(&kp, 1, 100));
            keys.push(kp);
        }
        let limited = map.entries_newer_than(&[], 5);
        assert_eq!(limited.len(), 5);
    }

    #[test]
    fn take_fresh_drains_dirty_set() {
        let mut map = HiveMap::new();
        let kp = Keypair::generate();
        map.apply_verified_member(entry_for(&kp, 1, 100));
        assert_eq!(map.take_fresh(10).len(), 1);
        // Second drain is empty until another change lands.
        assert!(map.take_fresh(10).is_empty());
        map.apply_verified_member(entry_for(&kp, 2, 150));
        assert_eq!(map.take_fresh(10).len(), 1);
    }

    #[test]
    fn total_capacity_aggregates() {
        let mut map = HiveMap::new();
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        map.apply_verified_member(entry_for(&kp_a, 1, 100));
        map.apply_verified_member(entry_for(&kp_b, 1, 250));
        assert_eq!(map.total_capacity_msat(), 350);
    }

    #[test]
    fn rate_limiter_window() {
        let mut limiter = SenderRateLimiter::new(10, Duration::from_secs(1));
        let sender = Keypair::generate().peer_id();
        let now = now_ms();
        assert_eq!(limiter.admit(sender, 8, now), 8);
        assert_eq!(limiter.admit(sender, 8, now), 2);
        assert_eq!(limiter.admit(sender, 8, now), 0);
        // Window rolls over.
        assert_eq!(limiter.admit(sender, 8, now + 2_000), 8);
    }

    #[test]
    fn local_entry_version_strictly_increases() {
        let kp = Keypair::generate();
        let first = sign_local_entry(&kp, profile(1), None);
        let second = sign_local_entry(&kp, profile(2), Some(first.version));
        assert!(second.version > first.version);
    }

    async fn member_fixture() -> (Membership, Keypair) {
        let membership = Membership::spawn(MembershipConfig::default());
        let member = Keypair::generate();
        membership.seed_admin(member.peer_id()).await;
        (membership, member)
    }

    #[tokio::test]
    async fn non_member_entries_rejected_row_count_unchanged() {
        let (membership, member) = member_fixture().await;
        let rpc = Arc::new(RecordingRpc::default());
        let state = StateManager::spawn(
            Keypair::generate(),
            membership.clone(),
            rpc,
            StateConfig::default(),
        );

        // 50 well-formed entries, all subjects unknown to membership.
        let mut entries = Vec::new();
        for _ in 0..50 {
            let stranger = Keypair::generate();
            entries.push(entry_for(&stranger, 1, 100));
        }
        let before = state.snapshot().await.len();
        let report = state.apply_push(entries, member.peer_id()).await;
        assert_eq!(report.applied, 0);
        assert_eq!(report.rejected, 50);
        assert_eq!(state.snapshot().await.len(), before);

        state.quit().await;
        membership.quit().await;
    }

    #[tokio::test]
    async fn sync_request_from_non_member_refused() {
        let (membership, _member) = member_fixture().await;
        let rpc = Arc::new(RecordingRpc::default());
        let state = StateManager::spawn(
            Keypair::generate(),
            membership.clone(),
            rpc,
            StateConfig::default(),
        );

        let stranger = Keypair::generate();
        let result = state.handle_sync_request(Vec::new(), stranger.peer_id()).await;
        assert_eq!(result, Err(SyncError::NotAMember));

        state.quit().await;
        membership.quit().await;
    }

    #[tokio::test]
    async fn member_entries_merge_through_actor() {
        let (membership, member) = member_fixture().await;
        let rpc = Arc::new(RecordingRpc::default());
        let state = StateManager::spawn(
            Keypair::generate(),
            membership.clone(),
            rpc,
            StateConfig::default(),
        );

        let entry = entry_for(&member, 4, 500);
        let report = state.apply_push(vec![entry], member.peer_id()).await;
        assert_eq!(report.applied, 1);
        assert_eq!(state.total_capacity_msat().await, 500);
        assert_eq!(state.get(member.peer_id()).await.unwrap().version, 4);

        state.quit().await;
        membership.quit().await;
    }
}
