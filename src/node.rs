//! # High-Level Node API
//!
//! A [`HiveNode`] combines the coordination components — transport,
//! membership, handshake engine, gossip state manager, relay/dedup layer,
//! and intent lock manager — into a single unified interface.
//!
//! ## Quick Start
//!
//! ```ignore
//! // Founding node
//! let node = HiveNode::bind("0.0.0.0:9735", HiveConfig::default()).await?;
//! node.bootstrap_genesis().await;
//! let ticket = node.issue_ticket(invitee_id).await;
//!
//! // Joining node
//! let node = HiveNode::bind("0.0.0.0:0", HiveConfig::default()).await?;
//! node.join(founder_id, founder_addr, ticket).await?;
//! node.update_profile(my_profile).await?;
//! ```
//!
//! ## Frame Flow
//!
//! Inbound frames arrive on one dispatch loop. Handshake frames reach the
//! handshake engine directly; everything else is dropped unless the direct
//! sender holds a live attestation AND the envelope signature verifies
//! against the frame's origin. Relayable frames fan back out through the
//! dedup layer after local processing.
//!
//! ## Side Effects
//!
//! Exclusive actions (channel opens, bans, promotions) go through the
//! intent lock. Committed intents surface as events; their side effects —
//! the ban itself, the promotion broadcast, the fee-policy call through
//! the circuit-breaker bridge — execute here in the event loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bridge::{
    BreakerBridge, BreakerConfig, FeePolicy, FeePolicyBridge, NullBridge,
};
use crate::crypto::{verify_with_domain, VOUCH_SIGNATURE_DOMAIN};
use crate::handshake::{
    sign_challenge_response, verify_attestation, Handshake, HandshakeConfig,
};
use crate::identity::{now_ms, Keypair, PeerId};
use crate::intent::{
    AbortReason, GovernanceGate, IntentConfig, IntentEvent, IntentManager, ObserveOutcome,
    PendingIntent,
};
use crate::membership::{
    make_vouch, Membership, MembershipConfig, MembershipRecord, Ticket, Tier, VouchOutcome,
};
use crate::protocols::HiveBroadcast;
use crate::relay::{Relay, RelayConfig};
use crate::state::{StateConfig, StateManager};
use crate::store::{DurableStore, MemoryStore, SerializedStore};
use crate::transport::{
    connection_identity, read_frames, HiveTransport, InboundFrame,
};
use crate::wire::{
    Frame, FramePayload, IntentAction, PeerProfile, StateEntry, VouchRecord, MAX_ROSTER_ENTRIES,
};

/// Wire protocol version carried in `Hello`.
pub const PROTOCOL_VERSION: u16 = 1;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct HiveConfig {
    pub membership: MembershipConfig,
    pub handshake: HandshakeConfig,
    pub state: StateConfig,
    pub relay: RelayConfig,
    pub intent: IntentConfig,
    pub breaker: BreakerConfig,
    /// Initial governance mode. When false, policy-gated intents abort at
    /// commit time instead of executing.
    pub autonomous: bool,
    /// Validity window for tickets this node issues.
    pub ticket_validity: Duration,
}

impl HiveConfig {
    pub fn new() -> Self {
        Self {
            membership: MembershipConfig::default(),
            handshake: HandshakeConfig::default(),
            state: StateConfig::default(),
            relay: RelayConfig::default(),
            intent: IntentConfig::default(),
            breaker: BreakerConfig::default(),
            autonomous: true,
            ticket_validity: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Engine (shared dispatcher context)
// ============================================================================

struct PendingPromotion {
    request_id: [u8; 16],
    vouches: Vec<VouchRecord>,
}

struct Engine {
    keypair: Keypair,
    transport: HiveTransport,
    membership: Membership,
    handshake: Handshake,
    state: StateManager,
    relay: Relay,
    intent: IntentManager,
    bridge: Arc<BreakerBridge<Box<dyn FeePolicyBridge>>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    /// Ticket staged by `join()`, presented when the responder challenges.
    pending_join: Mutex<Option<Ticket>>,
    /// Vouch rounds we completed, awaiting the promote intent's commit.
    pending_promotions: Mutex<HashMap<PeerId, PendingPromotion>>,
}

impl Engine {
    async fn handle_frame(self: &Arc<Self>, inbound: InboundFrame) {
        let InboundFrame { from, frame } = inbound;
        let payload = frame.payload.clone();

        if !payload.is_handshake() {
            // Gate 1: the direct sender must hold a live attestation.
            if !self.handshake.is_authenticated(from).await {
                debug!(peer = %from.short_hex(), "frame from unauthenticated peer dropped");
                return;
            }
            // Gate 2: the envelope signature must verify against the origin.
            if frame.verify_signature().is_err() {
                debug!(
                    peer = %from.short_hex(),
                    origin = %frame.origin.short_hex(),
                    "bad envelope signature, frame dropped"
                );
                return;
            }
            // Gate 3: point-to-point frames must originate from their sender.
            if !payload.is_relayable() && frame.origin != from {
                debug!(peer = %from.short_hex(), "non-relayable frame with foreign origin dropped");
                return;
            }
        }

        match payload {
            FramePayload::Hello {
                peer_id,
                protocol_version,
            } => self.on_hello(from, peer_id, protocol_version).await,
            FramePayload::Challenge { nonce, .. } => self.on_challenge(from, nonce).await,
            FramePayload::Attest {
                peer_id,
                nonce_signature,
                ticket,
            } => self.on_attest(from, peer_id, nonce_signature, ticket).await,
            FramePayload::Welcome { attestation } => {
                self.on_welcome(from, attestation).await
            }
            FramePayload::GossipPush { entries } => {
                self.on_gossip_push(from, frame, entries).await
            }
            FramePayload::FullSyncRequest { digest } => {
                match self.state.handle_sync_request(digest, from).await {
                    Ok(entries) => {
                        let mut roster = self.membership.snapshot().await;
                        roster.truncate(MAX_ROSTER_ENTRIES);
                        let reply = Frame::signed(
                            FramePayload::FullSyncResponse { entries, roster },
                            &self.keypair,
                        );
                        if let Err(e) = self.transport.send_to(from, reply).await {
                            debug!(peer = %from.short_hex(), error = %e, "sync response send failed");
                        }
                    }
                    Err(e) => {
                        debug!(peer = %from.short_hex(), error = %e, "sync request refused");
                    }
                }
            }
            FramePayload::FullSyncResponse { entries, roster } => {
                if !self.membership.is_known(from).await {
                    debug!(peer = %from.short_hex(), "sync response from unknown peer dropped");
                    return;
                }
                self.membership.merge_roster(roster).await;
                let report = self.state.apply_sync(entries, from).await;
                debug!(
                    peer = %from.short_hex(),
                    applied = report.applied,
                    rejected = report.rejected,
                    "sync response merged"
                );
            }
            FramePayload::IntentProposed { intent } | FramePayload::IntentHeld { intent } => {
                if intent.initiator != frame.origin
                    || !self.membership.is_member(frame.origin).await
                {
                    debug!(origin = %frame.origin.short_hex(), "intent from non-member dropped");
                    return;
                }
                let outcome = self.intent.observe_proposed(intent).await;
                if !matches!(outcome, ObserveOutcome::BadSignature) {
                    self.relay.relay(frame.clone(), frame.origin).await;
                }
            }
            FramePayload::IntentCommitted { intent } => {
                if intent.initiator != frame.origin
                    || !self.membership.is_member(frame.origin).await
                {
                    return;
                }
                self.intent.observe_committed(intent).await;
                self.relay.relay(frame.clone(), frame.origin).await;
            }
            FramePayload::IntentAborted { intent } => {
                if intent.initiator != frame.origin
                    || !self.membership.is_member(frame.origin).await
                {
                    return;
                }
                self.intent.observe_aborted(intent).await;
                self.relay.relay(frame.clone(), frame.origin).await;
            }
            FramePayload::Vouch { vouch } => {
                self.process_vouch(vouch, from).await;
            }
            FramePayload::PromotionRequest { target, request_id } => {
                if let Some(record) = self.membership.get(target).await {
                    if record.tier == Tier::Neophyte {
                        info!(
                            target = %target.short_hex(),
                            request_id = %hex::encode(request_id),
                            "promotion requested; vouch with `vouch_for` to support"
                        );
                    }
                }
                self.relay.relay(frame.clone(), frame.origin).await;
            }
            FramePayload::Promotion {
                target,
                request_id,
                vouches,
            } => {
                if !self.membership.is_member(frame.origin).await {
                    return;
                }
                self.on_promotion(target, request_id, vouches).await;
                self.relay.relay(frame.clone(), frame.origin).await;
            }
            FramePayload::Departure { peer_id } => {
                if peer_id != frame.origin {
                    return;
                }
                self.forget_peer(peer_id, false).await;
                self.relay.relay(frame.clone(), frame.origin).await;
            }
            FramePayload::Joined { record } => {
                if !self.membership.is_member(frame.origin).await
                    || record.tier != Tier::Neophyte
                {
                    return;
                }
                self.membership.merge_roster(vec![record]).await;
                self.relay.relay(frame.clone(), frame.origin).await;
            }
        }
    }

    async fn on_hello(&self, from: PeerId, claimed: PeerId, protocol_version: u16) {
        if protocol_version != PROTOCOL_VERSION {
            debug!(peer = %from.short_hex(), version = protocol_version, "protocol version mismatch");
            return;
        }
        if claimed != from {
            debug!(peer = %from.short_hex(), "hello identity does not match connection");
            return;
        }
        match self.handshake.begin(from).await {
            Ok(challenge) => {
                let frame = Frame::signed(
                    FramePayload::Challenge {
                        nonce: challenge.nonce,
                        expires_at: challenge.expires_at,
                    },
                    &self.keypair,
                );
                if let Err(e) = self.transport.send_to(from, frame).await {
                    debug!(peer = %from.short_hex(), error = %e, "challenge send failed");
                }
            }
            Err(e) => {
                debug!(peer = %from.short_hex(), error = %e, "challenge refused");
            }
        }
    }

    async fn on_challenge(&self, from: PeerId, nonce: [u8; 32]) {
        // We are the initiator: answer with proof of key possession plus
        // our staged ticket (empty on a member re-handshake).
        let ticket_bytes = self
            .pending_join
            .lock()
            .await
            .as_ref()
            .map(|t| t.encode())
            .unwrap_or_default();
        let frame = Frame::signed(
            FramePayload::Attest {
                peer_id: self.keypair.peer_id(),
                nonce_signature: sign_challenge_response(&self.keypair, &nonce),
                ticket: ticket_bytes,
            },
            &self.keypair,
        );
        if let Err(e) = self.transport.send_to(from, frame).await {
            debug!(peer = %from.short_hex(), error = %e, "attest send failed");
        }
    }

    async fn on_attest(
        &self,
        from: PeerId,
        claimed: PeerId,
        nonce_signature: Vec<u8>,
        ticket: Vec<u8>,
    ) {
        match self
            .handshake
            .complete(claimed, from, nonce_signature, ticket)
            .await
        {
            Ok(outcome) => {
                self.transport.mark_ready(from).await;
                let welcome = Frame::signed(
                    FramePayload::Welcome {
                        attestation: outcome.attestation,
                    },
                    &self.keypair,
                );
                if let Err(e) = self.transport.send_to(from, welcome).await {
                    debug!(peer = %from.short_hex(), error = %e, "welcome send failed");
                }
                if outcome.newly_joined {
                    let announce = Frame::signed(
                        FramePayload::Joined {
                            record: outcome.record,
                        },
                        &self.keypair,
                    );
                    if let Err(e) = self.transport.broadcast(announce).await {
                        debug!(error = %e, "join announcement failed");
                    }
                }
            }
            Err(e) => {
                // Terminal rejection: challenge already evicted, nothing
                // mutated. The peer may restart from Hello.
                debug!(peer = %from.short_hex(), error = %e, "handshake rejected");
            }
        }
    }

    async fn on_welcome(&self, from: PeerId, attestation: crate::wire::SessionAttestation) {
        if attestation.peer_id != self.keypair.peer_id() {
            return;
        }
        if let Err(e) = verify_attestation(&attestation, &from, now_ms()) {
            debug!(peer = %from.short_hex(), error = %e, "attestation rejected");
            return;
        }
        self.pending_join.lock().await.take();
        // Open our own gate for the responder's traffic and include it in
        // broadcasts.
        self.handshake.admit_session(from).await;
        self.transport.mark_ready(from).await;
        info!(peer = %from.short_hex(), "authenticated with responder");

        // Anti-entropy on join/reconnect: digest first, payloads after.
        let digest = self.state.digest().await;
        let frame = Frame::signed(FramePayload::FullSyncRequest { digest }, &self.keypair);
        if let Err(e) = self.transport.send_to(from, frame).await {
            debug!(peer = %from.short_hex(), error = %e, "sync request send failed");
        }
    }

    async fn on_gossip_push(&self, _from: PeerId, frame: Frame, entries: Vec<StateEntry>) {
        if !self.membership.is_known(frame.origin).await {
            debug!(origin = %frame.origin.short_hex(), "gossip from unknown origin dropped");
            return;
        }
        // Forward only what was fresh to us; the dedup cache suppresses
        // echoes either way.
        let report = self.state.apply_push(entries, frame.origin).await;
        if report.applied > 0 {
            self.relay.relay(frame.clone(), frame.origin).await;
        }
    }

    /// Shared vouch path for received frames and our own vouches.
    async fn process_vouch(self: &Arc<Self>, vouch: VouchRecord, sender: PeerId) {
        let target = vouch.target;
        let request_id = vouch.request_id;
        match self.membership.apply_vouch(vouch, sender).await {
            Ok(VouchOutcome::QuorumReached { tally, vouches, .. }) => {
                info!(
                    target = %target.short_hex(),
                    tally,
                    "promotion quorum reached, proposing intent"
                );
                self.pending_promotions.lock().await.insert(
                    target,
                    PendingPromotion {
                        request_id,
                        vouches,
                    },
                );
                // The intent lock keeps independent members from executing
                // the same promotion twice; losing the tie-break is fine.
                if let Err(e) = self.intent.propose(IntentAction::PromoteMember, target).await {
                    debug!(target = %target.short_hex(), error = %e, "promote intent not proposed");
                }
            }
            Ok(VouchOutcome::Recorded { tally, quorum }) => {
                debug!(target = %target.short_hex(), tally, quorum, "vouch recorded");
            }
            Ok(VouchOutcome::Duplicate) => {}
            Err(e) => {
                debug!(sender = %sender.short_hex(), error = %e, "vouch rejected");
            }
        }
    }

    /// Validate a promotion broadcast and apply it locally.
    async fn on_promotion(
        &self,
        target: PeerId,
        request_id: [u8; 16],
        vouches: Vec<VouchRecord>,
    ) {
        let (_, quorum) = self.membership.quorum_now().await;
        let mut valid: Vec<PeerId> = Vec::new();
        for vouch in &vouches {
            if vouch.target != target || vouch.request_id != request_id {
                continue;
            }
            if !self.membership.is_member(vouch.voucher).await {
                continue;
            }
            if verify_with_domain(
                &vouch.voucher,
                VOUCH_SIGNATURE_DOMAIN,
                &vouch.canonical_bytes(),
                &vouch.signature,
            )
            .is_err()
            {
                continue;
            }
            if !valid.contains(&vouch.voucher) {
                valid.push(vouch.voucher);
            }
        }
        if valid.len() < quorum {
            debug!(
                target = %target.short_hex(),
                valid = valid.len(),
                quorum,
                "promotion broadcast below quorum, ignored"
            );
            return;
        }
        match self.membership.promote(target, valid.len() as u32).await {
            Ok(record) => {
                info!(peer = %target.short_hex(), tier = %record.tier, "promotion applied");
            }
            Err(e) => {
                debug!(target = %target.short_hex(), error = %e, "promotion not applied");
            }
        }
    }

    /// Remove every trace of a peer (ban or departure).
    async fn forget_peer(&self, peer: PeerId, ban: bool) {
        if ban {
            self.membership.ban(peer).await;
        } else {
            self.membership.depart(peer).await;
        }
        self.state.remove(peer).await;
        self.handshake.revoke(peer).await;
        self.transport.invalidate(peer).await;
    }

    /// Execute the side effect of a committed intent.
    async fn execute_intent(self: &Arc<Self>, announce: &crate::wire::IntentAnnounce, local: bool) {
        match announce.action {
            IntentAction::BanPeer => {
                // Fleet-wide fact: every observer applies the ban.
                self.forget_peer(announce.target, true).await;
            }
            IntentAction::PromoteMember => {
                if !local {
                    // The winner broadcasts the vouch-carrying Promotion
                    // frame; we promote when it arrives with proofs.
                    return;
                }
                let pending = self.pending_promotions.lock().await.remove(&announce.target);
                let Some(pending) = pending else {
                    debug!(target = %announce.target.short_hex(), "no pending vouch round for committed promotion");
                    return;
                };
                let count = pending.vouches.len() as u32;
                if let Err(e) = self.membership.promote(announce.target, count).await {
                    debug!(target = %announce.target.short_hex(), error = %e, "promotion failed");
                    return;
                }
                let frame = Frame::signed(
                    FramePayload::Promotion {
                        target: announce.target,
                        request_id: pending.request_id,
                        vouches: pending.vouches,
                    },
                    &self.keypair,
                );
                if let Err(e) = self.transport.broadcast(frame).await {
                    debug!(error = %e, "promotion broadcast failed");
                }
                // Policy-gated side effect through the breaker: failure
                // degrades, it never blocks the engine.
                if let Err(e) = self
                    .bridge
                    .apply_fee_policy(announce.target, FeePolicy::MEMBER_ZERO)
                    .await
                {
                    warn!(
                        target = %announce.target.short_hex(),
                        error = %e,
                        "fee policy not applied, operating degraded"
                    );
                }
            }
            IntentAction::OpenChannel => {
                if local {
                    // Execution belongs to the expansion planner; the lock's
                    // job — making sure only one member opens it — is done.
                    info!(
                        target = %announce.target.short_hex(),
                        "channel open toward target authorized"
                    );
                }
            }
        }
    }
}

// ============================================================================
// HiveNode
// ============================================================================

/// Snapshot of node health for the query surface.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub peer_id: String,
    pub local_addr: SocketAddr,
    pub member_count: usize,
    pub entry_count: usize,
    pub total_capacity_msat: u64,
    pub pending_intents: usize,
    pub connected_peers: usize,
    pub pending_challenges: usize,
    /// True while the fee bridge circuit is open or half-open: the node is
    /// operating without the collaborator.
    pub fee_bridge_degraded: bool,
    pub autonomous: bool,
}

pub struct HiveNode {
    engine: Arc<Engine>,
    autonomous: Arc<AtomicBool>,
    local_addr: SocketAddr,
    ticket_validity: Duration,
    accept_task: tokio::task::JoinHandle<()>,
    dispatch_task: tokio::task::JoinHandle<()>,
    event_task: tokio::task::JoinHandle<()>,
}

impl HiveNode {
    /// Bind with a fresh identity, an in-memory store, and no fee bridge.
    pub async fn bind(addr: &str, config: HiveConfig) -> Result<Self> {
        Self::bind_with(addr, Keypair::generate(), config, Box::new(NullBridge)).await
    }

    /// Bind with an existing identity and fee bridge; in-memory store.
    pub async fn bind_with(
        addr: &str,
        keypair: Keypair,
        config: HiveConfig,
        bridge: Box<dyn FeePolicyBridge>,
    ) -> Result<Self> {
        let store: Arc<dyn DurableStore> =
            Arc::new(SerializedStore::new(Arc::new(MemoryStore::new())));
        Self::bind_full(addr, keypair, config, bridge, store).await
    }

    /// Fully-parameterized constructor.
    pub async fn bind_full(
        addr: &str,
        keypair: Keypair,
        config: HiveConfig,
        bridge: Box<dyn FeePolicyBridge>,
        store: Arc<dyn DurableStore>,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let (transport, endpoint, mut inbound_rx, inbound_tx) =
            HiveTransport::bind(&keypair, addr)?;
        let local_addr = transport.local_addr();

        let membership = Membership::spawn(config.membership.clone());
        let handshake = Handshake::spawn(
            keypair.clone(),
            membership.clone(),
            config.handshake.clone(),
        );
        let rpc = Arc::new(transport.clone());
        let state = StateManager::spawn(
            keypair.clone(),
            membership.clone(),
            rpc.clone(),
            config.state.clone(),
        );
        let relay = Relay::spawn(rpc.clone(), config.relay.clone());

        let autonomous = Arc::new(AtomicBool::new(config.autonomous));
        let gate: Arc<dyn GovernanceGate> = {
            let autonomous = autonomous.clone();
            Arc::new(move |_: &crate::wire::IntentAnnounce| autonomous.load(Ordering::SeqCst))
        };
        let bridge = Arc::new(BreakerBridge::new(bridge, config.breaker.clone()));
        let (intent, mut intent_events) = IntentManager::spawn(
            keypair.clone(),
            rpc,
            store,
            gate,
            config.intent.clone(),
        );

        let engine = Arc::new(Engine {
            keypair: keypair.clone(),
            transport: transport.clone(),
            membership,
            handshake,
            state,
            relay,
            intent,
            bridge,
            inbound_tx: inbound_tx.clone(),
            pending_join: Mutex::new(None),
            pending_promotions: Mutex::new(HashMap::new()),
        });

        // Accept loop: one read task per inbound connection, keyed by its
        // TLS-verified identity.
        let accept_task = {
            let transport = transport.clone();
            let inbound_tx = inbound_tx.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let transport = transport.clone();
                    let inbound_tx = inbound_tx.clone();
                    tokio::spawn(async move {
                        let connection = match incoming.await {
                            Ok(c) => c,
                            Err(e) => {
                                debug!(error = %e, "inbound connection failed");
                                return;
                            }
                        };
                        let Some(peer) = connection_identity(&connection) else {
                            connection.close(1u32.into(), b"no identity");
                            return;
                        };
                        transport.register(peer, connection.clone()).await;
                        read_frames(connection, peer, inbound_tx).await;
                    });
                }
            })
        };

        // Dispatch loop: frames processed sequentially against the engines.
        let dispatch_task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(inbound) = inbound_rx.recv().await {
                    engine.handle_frame(inbound).await;
                }
            })
        };

        // Intent event loop: committed/aborted intents and their effects.
        let event_task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                while let Some(event) = intent_events.recv().await {
                    match event {
                        IntentEvent::LocalCommitted(announce) => {
                            engine.execute_intent(&announce, true).await;
                        }
                        IntentEvent::RemoteCommitted(announce) => {
                            engine.execute_intent(&announce, false).await;
                        }
                        IntentEvent::LocalAborted { announce, reason } => match reason {
                            AbortReason::ConflictLost => info!(
                                action = %announce.action,
                                target = %announce.target.short_hex(),
                                "intent lost tie-break, aborted"
                            ),
                            AbortReason::GateRefused => info!(
                                action = %announce.action,
                                target = %announce.target.short_hex(),
                                "intent aborted by governance gate"
                            ),
                        },
                    }
                }
            })
        };

        info!("hive node {} on {}", keypair.peer_id().short_hex(), local_addr);

        Ok(Self {
            engine,
            autonomous,
            local_addr,
            ticket_validity: config.ticket_validity,
            accept_task,
            dispatch_task,
            event_task,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.engine.keypair.peer_id()
    }

    /// Hex identity for display and bootstrap strings.
    pub fn identity(&self) -> String {
        self.peer_id().to_hex()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Seed this node as a founding admin of a brand-new hive.
    pub async fn bootstrap_genesis(&self) {
        self.engine.membership.seed_admin(self.peer_id()).await;
        info!("genesis: seeded self as admin");
    }

    /// Join an existing hive through `responder` using an invitation
    /// ticket. The handshake continues asynchronously; on success the
    /// responder's attestation arrives and state sync begins.
    pub async fn join(&self, responder: PeerId, addr: SocketAddr, ticket: Ticket) -> Result<()> {
        let issuer = ticket.issuer;
        *self.engine.pending_join.lock().await = Some(ticket);

        // Bootstrap trust anchors: the inviter signed our ticket and we
        // chose to dial this responder. Both seed the table so their sync
        // roster and entries can verify.
        let now = now_ms();
        let anchor = |peer_id| MembershipRecord {
            peer_id,
            tier: Tier::Member,
            joined_at: now,
            last_seen: now,
            vouch_count: 0,
        };
        self.engine
            .membership
            .merge_roster(vec![anchor(issuer), anchor(responder)])
            .await;

        let connection = self.engine.transport.dial(responder, addr).await?;
        // Outbound connections need a read loop too.
        tokio::spawn(read_frames(
            connection,
            responder,
            self.engine.inbound_tx.clone(),
        ));

        let hello = Frame::signed(
            FramePayload::Hello {
                peer_id: self.peer_id(),
                protocol_version: PROTOCOL_VERSION,
            },
            &self.engine.keypair,
        );
        self.engine.transport.send_to(responder, hello).await?;
        Ok(())
    }

    /// Mint an invitation ticket for a new peer. Only meaningful from a
    /// member or admin — other nodes will refuse tickets we issue.
    pub async fn issue_ticket(&self, invitee: PeerId) -> Ticket {
        Ticket::issue(&self.engine.keypair, invitee, self.ticket_validity)
    }

    /// Publish a fresh profile for this node and push it immediately.
    pub async fn update_profile(&self, profile: PeerProfile) -> Result<()> {
        let entry = self
            .engine
            .state
            .update_local(profile)
            .await
            .context("state manager unavailable")?;
        let frame = Frame::signed(
            FramePayload::GossipPush {
                entries: vec![entry],
            },
            &self.engine.keypair,
        );
        self.engine.transport.broadcast(frame).await
    }

    /// Vouch for a neophyte's promotion in the given round.
    pub async fn vouch_for(&self, target: PeerId, request_id: [u8; 16]) -> Result<()> {
        let vouch = make_vouch(&self.engine.keypair, target, request_id);
        // Count our own vouch locally through the same path received
        // vouches take, then broadcast it to the fleet.
        self.engine
            .process_vouch(vouch.clone(), self.peer_id())
            .await;
        let frame = Frame::signed(FramePayload::Vouch { vouch }, &self.engine.keypair);
        self.engine.transport.broadcast(frame).await
    }

    /// Ask the fleet's members to open a promotion round for us.
    pub async fn request_promotion(&self) -> Result<[u8; 16]> {
        let mut request_id = [0u8; 16];
        getrandom::getrandom(&mut request_id).context("CSPRNG unavailable")?;
        let frame = Frame::signed(
            FramePayload::PromotionRequest {
                target: self.peer_id(),
                request_id,
            },
            &self.engine.keypair,
        );
        self.engine.transport.broadcast(frame).await?;
        Ok(request_id)
    }

    /// Propose an exclusive fleet-visible action through the intent lock.
    pub async fn propose(
        &self,
        action: IntentAction,
        target: PeerId,
    ) -> Result<(), crate::intent::ProposeError> {
        self.engine.intent.propose(action, target).await.map(|_| ())
    }

    /// Toggle autonomous mode. When off, policy-gated intents abort at
    /// commit time.
    pub fn set_autonomous(&self, autonomous: bool) {
        self.autonomous.store(autonomous, Ordering::SeqCst);
    }

    pub fn is_autonomous(&self) -> bool {
        self.autonomous.load(Ordering::SeqCst)
    }

    pub async fn members(&self) -> Vec<MembershipRecord> {
        self.engine.membership.snapshot().await
    }

    pub async fn pending_intents(&self) -> Vec<PendingIntent> {
        self.engine.intent.pending().await
    }

    pub async fn state_snapshot(&self) -> Vec<StateEntry> {
        self.engine.state.snapshot().await
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            peer_id: self.identity(),
            local_addr: self.local_addr,
            member_count: self.engine.membership.snapshot().await.len(),
            entry_count: self.engine.state.snapshot().await.len(),
            total_capacity_msat: self.engine.state.total_capacity_msat().await,
            pending_intents: self.engine.intent.pending().await.len(),
            connected_peers: self.engine.transport.connected_peers().await.len(),
            pending_challenges: self.engine.handshake.pending_challenges().await,
            fee_bridge_degraded: self.engine.bridge.is_degraded(),
            autonomous: self.is_autonomous(),
        }
    }

    /// Announce voluntary departure and shut down.
    pub async fn depart(self) {
        let frame = Frame::signed(
            FramePayload::Departure {
                peer_id: self.peer_id(),
            },
            &self.engine.keypair,
        );
        if let Err(e) = self.engine.transport.broadcast(frame).await {
            debug!(error = %e, "departure broadcast failed");
        }
        self.shutdown().await;
    }

    /// Stop accepting traffic and quit actors in reverse dependency order.
    pub async fn shutdown(self) {
        self.accept_task.abort();
        self.dispatch_task.abort();
        self.event_task.abort();

        self.engine.intent.quit().await;
        self.engine.relay.quit().await;
        self.engine.state.quit().await;
        self.engine.handshake.quit().await;
        self.engine.membership.quit().await;
        self.engine.transport.quit().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_profile() -> PeerProfile {
        PeerProfile {
            capacity_msat: 10_000_000,
            fee_base_msat: 1_000,
            fee_rate_ppm: 50,
            uptime_ppm: 995_000,
            addrs: vec![],
            topology_hints: vec![],
        }
    }

    #[tokio::test]
    async fn bind_genesis_and_status() {
        let node = HiveNode::bind("127.0.0.1:0", HiveConfig::new())
            .await
            .expect("bind");
        node.bootstrap_genesis().await;

        let status = node.status().await;
        assert_eq!(status.member_count, 1);
        assert_eq!(status.pending_intents, 0);
        assert!(!status.fee_bridge_degraded);
        assert!(status.autonomous);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn local_profile_update_lands_in_snapshot() {
        let node = HiveNode::bind("127.0.0.1:0", HiveConfig::new())
            .await
            .expect("bind");
        node.bootstrap_genesis().await;
        node.update_profile(test_profile()).await.expect("update");

        let snapshot = node.state_snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].peer_id, node.peer_id());
        assert_eq!(node.status().await.total_capacity_msat, 10_000_000);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn issued_tickets_verify() {
        let node = HiveNode::bind("127.0.0.1:0", HiveConfig::new())
            .await
            .expect("bind");
        let invitee = Keypair::generate();
        let ticket = node.issue_ticket(invitee.peer_id()).await;
        assert_eq!(ticket.issuer, node.peer_id());
        assert!(ticket.verify(now_ms()).is_ok());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn autonomous_toggle() {
        let node = HiveNode::bind("127.0.0.1:0", HiveConfig::new())
            .await
            .expect("bind");
        assert!(node.is_autonomous());
        node.set_autonomous(false);
        assert!(!node.is_autonomous());
        node.shutdown().await;
    }
}
