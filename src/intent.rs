//! # Intent Lock Manager
//!
//! Optimistic distributed mutual exclusion for exclusive, fleet-visible
//! actions (opening a channel, banning a peer, promoting a member). There
//! is no leader: a node that wants an action broadcasts its intent, waits
//! out a hold period for conflicting intents to propagate, and only then
//! commits.
//!
//! ## State machine per `(action, target)` key
//!
//! ```text
//! NONE → PROPOSED → HELD → { COMMITTED | ABORTED }
//! ```
//!
//! - A local intent is broadcast as `IntentProposed` and moves to `HELD`
//!   immediately.
//! - Conflicts resolve by a deterministic rule: the lexicographically
//!   smallest initiator `PeerId` wins. Every node that eventually observes
//!   all competing intents resolves the same winner, regardless of arrival
//!   order. A losing local intent broadcasts an explicit `IntentAborted`
//!   notice so other nodes never wait on a silent loser.
//! - The hold period absorbs gossip propagation delay: a winner commits
//!   only after the period elapses with no higher-priority conflict seen.
//! - Terminal states are immutable; replaying a `PROPOSED` frame whose
//!   `(action, target, initiator, proposed_at)` already reached a terminal
//!   state is a no-op.
//!
//! ## Atomic gated commit
//!
//! Externally-visible side effects can be policy-gated ("only execute in
//! autonomous mode"). The gate is evaluated *inside* the commit decision:
//! gate refusal aborts the intent before anything is written durably, so a
//! "committed but never executed" record cannot exist by construction.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::crypto::{
    sign_with_domain, verify_with_domain, INTENT_SIGNATURE_DOMAIN,
};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::protocols::HiveBroadcast;
use crate::store::{DurableStore, IntentRow};
use crate::wire::{Frame, FramePayload, IntentAction, IntentAnnounce};

// ============================================================================
// Configuration and Gate
// ============================================================================

#[derive(Clone, Debug)]
pub struct IntentConfig {
    /// How long a winning intent is held before it may commit.
    pub hold_period: Duration,
    /// Interval of the deadline sweep.
    pub sweep_interval: Duration,
    /// How long terminal records are kept for replay suppression.
    pub terminal_ttl: Duration,
    /// Capacity of the terminal record cache.
    pub terminal_capacity: usize,
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            hold_period: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            terminal_ttl: Duration::from_secs(600),
            terminal_capacity: 4_096,
        }
    }
}

/// Governance policy gate consulted atomically at commit time.
pub trait GovernanceGate: Send + Sync + 'static {
    fn permits(&self, intent: &IntentAnnounce) -> bool;
}

impl<F> GovernanceGate for F
where
    F: Fn(&IntentAnnounce) -> bool + Send + Sync + 'static,
{
    fn permits(&self, intent: &IntentAnnounce) -> bool {
        self(intent)
    }
}

/// Command channel capacity for the intent actor.
const INTENT_CHANNEL_SIZE: usize = 256;

/// Event channel capacity toward the node facade.
const INTENT_EVENT_CHANNEL_SIZE: usize = 64;

// ============================================================================
// Table Types
// ============================================================================

/// Lock key: one outstanding intent per action+target pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntentKey {
    pub action: IntentAction,
    pub target: PeerId,
}

impl IntentKey {
    pub fn of(announce: &IntentAnnounce) -> Self {
        Self {
            action: announce.action,
            target: announce.target,
        }
    }
}

/// Replay key: terminal outcomes are remembered per concrete announcement.
type ReplayKey = (IntentKey, PeerId, u64);

fn replay_key(announce: &IntentAnnounce) -> ReplayKey {
    (IntentKey::of(announce), announce.initiator, announce.proposed_at)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentState {
    Proposed,
    Held,
    Committed,
    Aborted,
}

impl std::fmt::Display for IntentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentState::Proposed => write!(f, "proposed"),
            IntentState::Held => write!(f, "held"),
            IntentState::Committed => write!(f, "committed"),
            IntentState::Aborted => write!(f, "aborted"),
        }
    }
}

/// An active (non-terminal) intent.
#[derive(Clone, Debug)]
pub struct PendingIntent {
    pub announce: IntentAnnounce,
    pub state: IntentState,
    pub hold_deadline: u64,
    /// Whether this node initiated the intent (and so owns its side effect).
    pub is_local: bool,
}

/// Outcome of observing a remote proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// New intent tracked (it currently wins its key).
    Tracked,
    /// Identical announcement already active; idempotent no-op.
    Duplicate,
    /// Announcement already reached a terminal state; replay suppressed.
    ReplayRejected,
    /// Incoming intent lost the tie-break against the active holder.
    LostTieBreak,
    /// Incoming intent won; our local intent was aborted. Carries our
    /// displaced announcement so its abort notice names the original
    /// `(initiator, proposed_at)` other nodes are tracking.
    LocalIntentDisplaced(IntentAnnounce),
    /// Signature over the canonical intent bytes failed; dropped.
    BadSignature,
}

/// Notifications surfaced to the node facade.
#[derive(Debug, Clone)]
pub enum IntentEvent {
    /// A local intent committed; execute its side effect now. The gate has
    /// already passed and the durable record is written.
    LocalCommitted(IntentAnnounce),
    /// A local intent aborted (tie-break loss or gate refusal).
    LocalAborted {
        announce: IntentAnnounce,
        reason: AbortReason,
    },
    /// A remote intent committed (informational; the winner executes).
    RemoteCommitted(IntentAnnounce),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// Lost the deterministic tie-break. Expected outcome, not an error.
    ConflictLost,
    /// Governance gate refused at commit time.
    GateRefused,
}

// ============================================================================
// Intent Table (pure)
// ============================================================================

/// What the sweep decided for one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SweepAction {
    CommitLocal(IntentAnnounce),
    CommitRemote(IntentAnnounce),
    AbortLocalGate(IntentAnnounce),
}

/// Pure intent bookkeeping. The actor is its only owner; all methods are
/// CPU-bound and never block.
pub struct IntentTable {
    active: HashMap<IntentKey, PendingIntent>,
    /// Terminal outcomes with insertion time, for replay suppression.
    terminal: LruCache<ReplayKey, (IntentState, u64)>,
    terminal_ttl_ms: u64,
}

impl IntentTable {
    pub fn new(config: &IntentConfig) -> Self {
        Self {
            active: HashMap::new(),
            terminal: LruCache::new(
                NonZeroUsize::new(config.terminal_capacity.max(1)).expect("capacity >= 1"),
            ),
            terminal_ttl_ms: config.terminal_ttl.as_millis() as u64,
        }
    }

    pub fn pending(&self) -> Vec<PendingIntent> {
        let mut out: Vec<_> = self.active.values().cloned().collect();
        out.sort_by_key(|p| (p.announce.target, p.announce.initiator));
        out
    }

    pub fn terminal_state(&self, announce: &IntentAnnounce) -> Option<IntentState> {
        self.terminal.peek(&replay_key(announce)).map(|(s, _)| *s)
    }

    fn record_terminal(&mut self, announce: &IntentAnnounce, state: IntentState, now: u64) {
        self.terminal.put(replay_key(announce), (state, now));
    }

    /// Track a local intent. It enters `Held` immediately; the caller
    /// broadcasts the `IntentProposed` frame. If a competing intent is
    /// already active and wins the tie-break, the local intent is aborted
    /// up front.
    pub fn propose_local(
        &mut self,
        announce: IntentAnnounce,
        hold_period_ms: u64,
        now: u64,
    ) -> Result<(), AbortReason> {
        let key = IntentKey::of(&announce);
        if let Some(existing) = self.active.get(&key) {
            // Deterministic rule: smallest initiator wins.
            if existing.announce.initiator <= announce.initiator {
                self.record_terminal(&announce, IntentState::Aborted, now);
                return Err(AbortReason::ConflictLost);
            }
            // Our intent wins; displace the remote holder.
            let displaced = existing.announce.clone();
            self.record_terminal(&displaced, IntentState::Aborted, now);
        }
        self.active.insert(
            key,
            PendingIntent {
                announce,
                state: IntentState::Held,
                hold_deadline: now + hold_period_ms,
                is_local: true,
            },
        );
        Ok(())
    }

    /// Observe a remote `IntentProposed`. Signature is verified here —
    /// protocol logic is CPU-bound and runs outside any lock or await.
    pub fn observe_proposed(
        &mut self,
        announce: IntentAnnounce,
        hold_period_ms: u64,
        now: u64,
    ) -> ObserveOutcome {
        if verify_with_domain(
            &announce.initiator,
            INTENT_SIGNATURE_DOMAIN,
            &announce.canonical_bytes(),
            &announce.signature,
        )
        .is_err()
        {
            return ObserveOutcome::BadSignature;
        }
        // Idempotence: terminal announcements never re-enter the table.
        if self.terminal.peek(&replay_key(&announce)).is_some() {
            return ObserveOutcome::ReplayRejected;
        }
        let key = IntentKey::of(&announce);
        match self.active.get(&key) {
            None => {
                self.active.insert(
                    key,
                    PendingIntent {
                        announce,
                        state: IntentState::Held,
                        hold_deadline: now + hold_period_ms,
                        is_local: false,
                    },
                );
                ObserveOutcome::Tracked
            }
            Some(existing)
                if existing.announce.initiator == announce.initiator
                    && existing.announce.proposed_at == announce.proposed_at =>
            {
                ObserveOutcome::Duplicate
            }
            Some(existing) => {
                if announce.initiator < existing.announce.initiator {
                    // Incoming wins. The displaced holder aborts.
                    let was_local = existing.is_local;
                    let displaced = existing.announce.clone();
                    self.record_terminal(&displaced, IntentState::Aborted, now);
                    self.active.insert(
                        key,
                        PendingIntent {
                            announce,
                            state: IntentState::Held,
                            hold_deadline: now + hold_period_ms,
                            is_local: false,
                        },
                    );
                    if was_local {
                        ObserveOutcome::LocalIntentDisplaced(displaced)
                    } else {
                        ObserveOutcome::Tracked
                    }
                } else {
                    self.record_terminal(&announce, IntentState::Aborted, now);
                    ObserveOutcome::LostTieBreak
                }
            }
        }
    }

    /// Observe an explicit abort notice for an active intent.
    pub fn observe_aborted(&mut self, announce: &IntentAnnounce, now: u64) {
        let key = IntentKey::of(announce);
        let matches = self
            .active
            .get(&key)
            .map(|p| {
                p.announce.initiator == announce.initiator
                    && p.announce.proposed_at == announce.proposed_at
                    && !p.is_local
            })
            .unwrap_or(false);
        if matches {
            self.active.remove(&key);
        }
        self.record_terminal(announce, IntentState::Aborted, now);
    }

    /// Observe a commit notice: the winner finished its hold period.
    pub fn observe_committed(&mut self, announce: &IntentAnnounce, now: u64) -> bool {
        if matches!(
            self.terminal.peek(&replay_key(announce)),
            Some((IntentState::Committed, _))
        ) {
            return false;
        }
        let key = IntentKey::of(announce);
        let matches = self
            .active
            .get(&key)
            .map(|p| !p.is_local)
            .unwrap_or(false);
        if matches {
            self.active.remove(&key);
        }
        self.record_terminal(announce, IntentState::Committed, now);
        true
    }

    /// Advance hold deadlines. The gate is consulted here, inside the same
    /// decision that transitions state — commit and gate are one atomic
    /// step, never two observable ones.
    fn sweep_deadlines(&mut self, now: u64, gate: &dyn GovernanceGate) -> Vec<SweepAction> {
        let due: Vec<IntentKey> = self
            .active
            .iter()
            .filter(|(_, p)| p.hold_deadline <= now)
            .map(|(k, _)| *k)
            .collect();
        let mut actions = Vec::new();
        for key in due {
            let pending = match self.active.remove(&key) {
                Some(p) => p,
                None => continue,
            };
            if pending.is_local {
                if gate.permits(&pending.announce) {
                    self.record_terminal(&pending.announce, IntentState::Committed, now);
                    actions.push(SweepAction::CommitLocal(pending.announce));
                } else {
                    // Gate refused: the intent aborts without ever having
                    // been observable as committed.
                    self.record_terminal(&pending.announce, IntentState::Aborted, now);
                    actions.push(SweepAction::AbortLocalGate(pending.announce));
                }
            } else {
                self.record_terminal(&pending.announce, IntentState::Committed, now);
                actions.push(SweepAction::CommitRemote(pending.announce));
            }
        }
        actions
    }

    /// Drop terminal records past their TTL.
    fn sweep_terminal(&mut self, now: u64) {
        let expired: Vec<ReplayKey> = self
            .terminal
            .iter()
            .filter(|(_, (_, at))| now.saturating_sub(*at) > self.terminal_ttl_ms)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.terminal.pop(&key);
        }
    }
}

/// Build and sign an intent announcement for a local proposal.
pub fn make_announce(
    keypair: &Keypair,
    action: IntentAction,
    target: PeerId,
) -> IntentAnnounce {
    let mut announce = IntentAnnounce {
        action,
        target,
        initiator: keypair.peer_id(),
        proposed_at: now_ms(),
        signature: Vec::new(),
    };
    announce.signature = sign_with_domain(
        keypair,
        INTENT_SIGNATURE_DOMAIN,
        &announce.canonical_bytes(),
    );
    announce
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposeError {
    /// A competing intent for this key already wins the tie-break.
    ConflictLost,
    /// Engine unavailable (shutting down).
    Unavailable,
}

impl std::fmt::Display for ProposeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposeError::ConflictLost => write!(f, "intent lost to an existing proposal"),
            ProposeError::Unavailable => write!(f, "intent manager unavailable"),
        }
    }
}

impl std::error::Error for ProposeError {}

enum IntentCommand {
    ProposeLocal {
        action: IntentAction,
        target: PeerId,
        reply: oneshot::Sender<Result<IntentAnnounce, ProposeError>>,
    },
    ObserveProposed {
        announce: IntentAnnounce,
        reply: oneshot::Sender<ObserveOutcome>,
    },
    ObserveAborted {
        announce: IntentAnnounce,
    },
    ObserveCommitted {
        announce: IntentAnnounce,
    },
    Pending {
        reply: oneshot::Sender<Vec<PendingIntent>>,
    },
    Quit,
}

struct IntentActor<R: HiveBroadcast> {
    table: IntentTable,
    keypair: Keypair,
    rpc: Arc<R>,
    store: Arc<dyn DurableStore>,
    gate: Arc<dyn GovernanceGate>,
    events: mpsc::Sender<IntentEvent>,
    config: IntentConfig,
}

impl<R: HiveBroadcast> IntentActor<R> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<IntentCommand>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.tick().await; // skip immediate tick
        let mut terminal_sweep_counter = 0u32;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(IntentCommand::ProposeLocal { action, target, reply }) => {
                            let result = self.propose_local(action, target).await;
                            let _ = reply.send(result);
                        }
                        Some(IntentCommand::ObserveProposed { announce, reply }) => {
                            let outcome = self.observe_proposed(announce).await;
                            let _ = reply.send(outcome);
                        }
                        Some(IntentCommand::ObserveAborted { announce }) => {
                            // Abort notices carry the aborting initiator's own
                            // signature; a forged notice is dropped.
                            if announce_signature_ok(&announce) {
                                self.table.observe_aborted(&announce, now_ms());
                            }
                        }
                        Some(IntentCommand::ObserveCommitted { announce }) => {
                            if announce_signature_ok(&announce)
                                && self.table.observe_committed(&announce, now_ms())
                            {
                                let _ = self
                                    .events
                                    .send(IntentEvent::RemoteCommitted(announce))
                                    .await;
                            }
                        }
                        Some(IntentCommand::Pending { reply }) => {
                            let _ = reply.send(self.table.pending());
                        }
                        Some(IntentCommand::Quit) | None => {
                            debug!("intent actor shutting down");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.run_sweep().await;
                    terminal_sweep_counter += 1;
                    if terminal_sweep_counter >= 60 {
                        terminal_sweep_counter = 0;
                        self.table.sweep_terminal(now_ms());
                    }
                }
            }
        }
    }

    async fn propose_local(
        &mut self,
        action: IntentAction,
        target: PeerId,
    ) -> Result<IntentAnnounce, ProposeError> {
        let announce = make_announce(&self.keypair, action, target);
        let now = now_ms();
        let hold_ms = self.config.hold_period.as_millis() as u64;
        match self.table.propose_local(announce.clone(), hold_ms, now) {
            Ok(()) => {
                info!(
                    action = %action,
                    target = %target.short_hex(),
                    "intent proposed, holding"
                );
                let frame = Frame::signed(
                    FramePayload::IntentProposed {
                        intent: announce.clone(),
                    },
                    &self.keypair,
                );
                if let Err(e) = self.rpc.broadcast(frame).await {
                    debug!(error = %e, "intent broadcast failed");
                }
                Ok(announce)
            }
            Err(AbortReason::ConflictLost) => {
                debug!(
                    action = %action,
                    target = %target.short_hex(),
                    "intent lost tie-break at proposal time"
                );
                Err(ProposeError::ConflictLost)
            }
            Err(AbortReason::GateRefused) => unreachable!("gate is not consulted at proposal"),
        }
    }

    async fn observe_proposed(&mut self, announce: IntentAnnounce) -> ObserveOutcome {
        let now = now_ms();
        let hold_ms = self.config.hold_period.as_millis() as u64;
        let outcome = self.table.observe_proposed(announce, hold_ms, now);
        if let ObserveOutcome::LocalIntentDisplaced(displaced) = &outcome {
            // Our intent lost: broadcast the explicit abort (our original
            // announcement, so its replay key matches what other nodes are
            // tracking) so nobody waits on a silent loser.
            let frame = Frame::signed(
                FramePayload::IntentAborted {
                    intent: displaced.clone(),
                },
                &self.keypair,
            );
            if let Err(e) = self.rpc.broadcast(frame).await {
                debug!(error = %e, "abort broadcast failed");
            }
            let _ = self
                .events
                .send(IntentEvent::LocalAborted {
                    announce: displaced.clone(),
                    reason: AbortReason::ConflictLost,
                })
                .await;
        }
        outcome
    }

    async fn run_sweep(&mut self) {
        let actions = self.table.sweep_deadlines(now_ms(), self.gate.as_ref());
        for action in actions {
            match action {
                SweepAction::CommitLocal(announce) => {
                    // Gate already passed inside the sweep decision; write
                    // the durable record, then broadcast and execute.
                    let row = IntentRow {
                        action: announce.action,
                        target: announce.target,
                        initiator: announce.initiator,
                        proposed_at: announce.proposed_at,
                        state: IntentState::Committed,
                    };
                    if let Err(e) = self.store.record_intent(row).await {
                        // Degraded mode: the commit stands, durability
                        // catches up when the store recovers.
                        warn!(error = %e, "durable intent record failed, continuing degraded");
                    }
                    info!(
                        action = %announce.action,
                        target = %announce.target.short_hex(),
                        "intent committed"
                    );
                    let frame = Frame::signed(
                        FramePayload::IntentCommitted {
                            intent: announce.clone(),
                        },
                        &self.keypair,
                    );
                    if let Err(e) = self.rpc.broadcast(frame).await {
                        debug!(error = %e, "commit broadcast failed");
                    }
                    let _ = self.events.send(IntentEvent::LocalCommitted(announce)).await;
                }
                SweepAction::AbortLocalGate(announce) => {
                    info!(
                        action = %announce.action,
                        target = %announce.target.short_hex(),
                        "intent aborted: governance gate refused"
                    );
                    let frame = Frame::signed(
                        FramePayload::IntentAborted {
                            intent: announce.clone(),
                        },
                        &self.keypair,
                    );
                    if let Err(e) = self.rpc.broadcast(frame).await {
                        debug!(error = %e, "abort broadcast failed");
                    }
                    let _ = self
                        .events
                        .send(IntentEvent::LocalAborted {
                            announce,
                            reason: AbortReason::GateRefused,
                        })
                        .await;
                }
                SweepAction::CommitRemote(announce) => {
                    let _ = self
                        .events
                        .send(IntentEvent::RemoteCommitted(announce))
                        .await;
                }
            }
        }
    }
}

fn announce_signature_ok(announce: &IntentAnnounce) -> bool {
    verify_with_domain(
        &announce.initiator,
        INTENT_SIGNATURE_DOMAIN,
        &announce.canonical_bytes(),
        &announce.signature,
    )
    .is_ok()
}

/// Handle to the intent lock manager.
#[derive(Clone)]
pub struct IntentManager {
    cmd_tx: mpsc::Sender<IntentCommand>,
}

impl IntentManager {
    pub fn spawn<R: HiveBroadcast>(
        keypair: Keypair,
        rpc: Arc<R>,
        store: Arc<dyn DurableStore>,
        gate: Arc<dyn GovernanceGate>,
        config: IntentConfig,
    ) -> (Self, mpsc::Receiver<IntentEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(INTENT_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(INTENT_EVENT_CHANNEL_SIZE);
        let actor = IntentActor {
            table: IntentTable::new(&config),
            keypair,
            rpc,
            store,
            gate,
            events: event_tx,
            config,
        };
        tokio::spawn(actor.run(cmd_rx));
        (Self { cmd_tx }, event_rx)
    }

    /// Propose an exclusive action. On success the intent is held; commit
    /// or abort arrives later as an [`IntentEvent`].
    pub async fn propose(
        &self,
        action: IntentAction,
        target: PeerId,
    ) -> Result<IntentAnnounce, ProposeError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(IntentCommand::ProposeLocal {
                action,
                target,
                reply,
            })
            .await
            .map_err(|_| ProposeError::Unavailable)?;
        rx.await.unwrap_or(Err(ProposeError::Unavailable))
    }

    /// Feed a remote `IntentProposed` frame from an authenticated member.
    pub async fn observe_proposed(&self, announce: IntentAnnounce) -> ObserveOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(IntentCommand::ObserveProposed { announce, reply })
            .await
            .is_err()
        {
            return ObserveOutcome::BadSignature;
        }
        rx.await.unwrap_or(ObserveOutcome::BadSignature)
    }

    pub async fn observe_aborted(&self, announce: IntentAnnounce) {
        let _ = self
            .cmd_tx
            .send(IntentCommand::ObserveAborted { announce })
            .await;
    }

    pub async fn observe_committed(&self, announce: IntentAnnounce) {
        let _ = self
            .cmd_tx
            .send(IntentCommand::ObserveCommitted { announce })
            .await;
    }

    pub async fn pending(&self) -> Vec<PendingIntent> {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(IntentCommand::Pending { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(IntentCommand::Quit).await;
    }
}
