//! # Relay / Dedup Layer
//!
//! Forwards gossip frames toward other members while suppressing
//! re-broadcast storms. The hive's gossip topology has cycles; without
//! dedup, one frame would echo between peers indefinitely.
//!
//! A frame is fingerprinted as `blake3(origin ‖ type_tag ‖ payload_bytes)`
//! and checked against a recently-forwarded cache before fan-out. The cache
//! is bounded twice over — by capacity (LRU eviction) and by TTL (expired
//! entries are re-forwardable and swept periodically) — so sustained gossip
//! traffic recycles the cache but can never grow it.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::identity::{now_ms, PeerId};
use crate::protocols::HiveBroadcast;
use crate::wire::{serialize_payload, Frame};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Seen-cache capacity. LRU eviction beyond this.
    pub seen_cache_capacity: usize,
    /// How long a fingerprint suppresses re-forwarding.
    pub seen_ttl: Duration,
    /// Interval for the expired-entry sweep.
    pub sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            seen_cache_capacity: 10_000,
            seen_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Command channel capacity for the relay actor.
const RELAY_CHANNEL_SIZE: usize = 256;

// ============================================================================
// Fingerprints and Seen Cache
// ============================================================================

/// Content fingerprint of a frame as forwarded by a given origin.
pub type Fingerprint = [u8; 32];

/// Fingerprint a frame: origin identity, type tag, and the serialized
/// payload. Two members pushing byte-identical payloads are distinct
/// fingerprints (each origin's copy forwards once).
pub fn fingerprint(origin: &PeerId, frame: &Frame) -> Fingerprint {
    let payload_bytes =
        serialize_payload(&frame.payload).expect("payload serialization is infallible");
    let mut hasher = blake3::Hasher::new();
    hasher.update(origin.as_bytes());
    hasher.update(&frame.payload.type_tag().to_le_bytes());
    hasher.update(&payload_bytes);
    *hasher.finalize().as_bytes()
}

/// Bounded recently-forwarded cache. Pure logic; the relay actor owns it.
pub struct SeenCache {
    entries: LruCache<Fingerprint, u64>,
    ttl_ms: u64,
}

impl SeenCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).expect("capacity >= 1")),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    /// Returns `true` if the fingerprint is fresh (forward it) and records
    /// it; `false` if it is a live duplicate (drop silently). An expired
    /// entry counts as fresh and is re-recorded.
    pub fn check_and_record(&mut self, fp: Fingerprint, now: u64) -> bool {
        if let Some(seen_at) = self.entries.get(&fp) {
            if now.saturating_sub(*seen_at) <= self.ttl_ms {
                return false;
            }
        }
        self.entries.put(fp, now);
        true
    }

    /// Remove entries past the TTL so the cache never retains dead
    /// fingerprints beyond a sweep interval.
    pub fn sweep(&mut self, now: u64) {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, seen_at)| now.saturating_sub(**seen_at) > self.ttl_ms)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in expired {
            self.entries.pop(&fp);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum RelayCommand {
    Relay {
        frame: Frame,
        origin: PeerId,
        reply: oneshot::Sender<bool>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
    Quit,
}

struct RelayActor<R: HiveBroadcast> {
    seen: SeenCache,
    rpc: Arc<R>,
    sweep_interval: Duration,
}

impl<R: HiveBroadcast> RelayActor<R> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RelayCommand>) {
        let mut sweep = tokio::time::interval(self.sweep_interval);
        sweep.tick().await; // skip immediate tick

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::Relay { frame, origin, reply }) => {
                            let forwarded = self.relay(frame, origin).await;
                            let _ = reply.send(forwarded);
                        }
                        Some(RelayCommand::Len { reply }) => {
                            let _ = reply.send(self.seen.len());
                        }
                        Some(RelayCommand::Quit) | None => {
                            debug!("relay actor shutting down");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.seen.sweep(now_ms());
                }
            }
        }
    }

    async fn relay(&mut self, frame: Frame, origin: PeerId) -> bool {
        let fp = fingerprint(&origin, &frame);
        if !self.seen.check_and_record(fp, now_ms()) {
            trace!(origin = %origin.short_hex(), "duplicate frame suppressed");
            return false;
        }
        if let Err(e) = self.rpc.broadcast_except(frame, origin).await {
            debug!(error = %e, "relay fan-out failed");
        }
        true
    }
}

/// Handle to the relay actor.
#[derive(Clone)]
pub struct Relay {
    cmd_tx: mpsc::Sender<RelayCommand>,
}

impl Relay {
    pub fn spawn<R: HiveBroadcast>(rpc: Arc<R>, config: RelayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RELAY_CHANNEL_SIZE);
        let actor = RelayActor {
            seen: SeenCache::new(config.seen_cache_capacity, config.seen_ttl),
            rpc,
            sweep_interval: config.sweep_interval,
        };
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    /// Forward a frame toward other members unless it was already relayed
    /// recently. Returns whether the frame was forwarded.
    pub async fn relay(&self, frame: Frame, origin: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::Relay {
                frame,
                origin,
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn seen_len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::Len { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::protocols::testing::{RecordingRpc, SentTo};
    use crate::wire::FramePayload;

    fn frame_for(peer: &Keypair) -> Frame {
        Frame::signed(
            FramePayload::Departure {
                peer_id: peer.peer_id(),
            },
            peer,
        )
    }

    #[test]
    fn seen_cache_suppresses_live_duplicates() {
        let mut cache = SeenCache::new(16, Duration::from_secs(60));
        let fp = [1u8; 32];
        let now = now_ms();
        assert!(cache.check_and_record(fp, now));
        assert!(!cache.check_and_record(fp, now));
        assert!(!cache.check_and_record(fp, now + 1_000));
    }

    #[test]
    fn seen_cache_ttl_allows_reforward() {
        let mut cache = SeenCache::new(16, Duration::from_millis(100));
        let fp = [2u8; 32];
        let now = now_ms();
        assert!(cache.check_and_record(fp, now));
        // Past the TTL the fingerprint is fresh again.
        assert!(cache.check_and_record(fp, now + 200));
    }

    #[test]
    fn seen_cache_capacity_bounded() {
        let mut cache = SeenCache::new(8, Duration::from_secs(60));
        let now = now_ms();
        for i in 0..100u8 {
            let mut fp = [0u8; 32];
            fp[0] = i;
            cache.check_and_record(fp, now);
        }
        assert_eq!(cache.len(), 8);
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let mut cache = SeenCache::new(16, Duration::from_millis(50));
        let now = now_ms();
        cache.check_and_record([1u8; 32], now);
        cache.check_and_record([2u8; 32], now);
        cache.sweep(now + 1_000);
        assert!(cache.is_empty());
    }

    #[test]
    fn fingerprint_distinguishes_origin_and_payload() {
        let kp_a = Keypair::generate();
        let kp_b = Keypair::generate();
        let frame = frame_for(&kp_a);
        let fp_same = fingerprint(&kp_a.peer_id(), &frame);
        assert_eq!(fp_same, fingerprint(&kp_a.peer_id(), &frame));
        // Different origin, same payload: distinct fingerprint.
        assert_ne!(fp_same, fingerprint(&kp_b.peer_id(), &frame));
        // Different payload, same origin: distinct fingerprint.
        let other_frame = frame_for(&kp_b);
        assert_ne!(fp_same, fingerprint(&kp_a.peer_id(), &other_frame));
    }

    #[tokio::test]
    async fn relay_forwards_once_then_drops() {
        let rpc = Arc::new(RecordingRpc::default());
        let relay = Relay::spawn(rpc.clone(), RelayConfig::default());
        let origin = Keypair::generate();
        let frame = frame_for(&origin);

        assert!(relay.relay(frame.clone(), origin.peer_id()).await);
        assert!(!relay.relay(frame.clone(), origin.peer_id()).await);
        assert!(!relay.relay(frame, origin.peer_id()).await);

        let sent = rpc.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, SentTo::AllExcept(origin.peer_id()));

        relay.quit().await;
    }

    #[tokio::test]
    async fn relay_treats_distinct_origins_separately() {
        let rpc = Arc::new(RecordingRpc::default());
        let relay = Relay::spawn(rpc.clone(), RelayConfig::default());
        let kp = Keypair::generate();
        let frame = frame_for(&kp);
        let origin_a = Keypair::generate().peer_id();
        let origin_b = Keypair::generate().peer_id();

        assert!(relay.relay(frame.clone(), origin_a).await);
        assert!(relay.relay(frame, origin_b).await);
        assert_eq!(rpc.sent_count().await, 2);

        relay.quit().await;
    }
}
