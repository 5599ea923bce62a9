//! Integration tests for the intent lock manager: deterministic conflict
//! resolution, replay idempotence, and the atomic governance gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use apiary::identity::{Keypair, PeerId};
use apiary::intent::{
    make_announce, IntentConfig, IntentEvent, IntentManager, ObserveOutcome,
};
use apiary::protocols::testing::RecordingRpc;
use apiary::store::{DurableStore, IntentRow, MemoryStore, StoreError};
use apiary::wire::{FramePayload, IntentAction};
use async_trait::async_trait;

fn fast_config() -> IntentConfig {
    IntentConfig {
        hold_period: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(20),
        ..IntentConfig::default()
    }
}

fn spawn_manager(
    keypair: Keypair,
    autonomous: Arc<AtomicBool>,
) -> (
    IntentManager,
    tokio::sync::mpsc::Receiver<IntentEvent>,
    Arc<MemoryStore>,
    Arc<RecordingRpc>,
) {
    let rpc = Arc::new(RecordingRpc::default());
    let store = Arc::new(MemoryStore::new());
    let gate = {
        let autonomous = autonomous.clone();
        Arc::new(move |_: &apiary::wire::IntentAnnounce| autonomous.load(Ordering::SeqCst))
    };
    let (manager, events) = IntentManager::spawn(
        keypair,
        rpc.clone(),
        store.clone(),
        gate,
        fast_config(),
    );
    (manager, events, store, rpc)
}

async fn next_event(
    events: &mut tokio::sync::mpsc::Receiver<IntentEvent>,
) -> IntentEvent {
    tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

#[tokio::test]
async fn both_sides_of_a_conflict_resolve_the_same_winner() {
    // Two managers propose the same action+target concurrently; each then
    // observes the other's announcement. The smaller initiator key must
    // win at both.
    let mut kp_small = Keypair::generate();
    let mut kp_big = Keypair::generate();
    if kp_small.peer_id() > kp_big.peer_id() {
        std::mem::swap(&mut kp_small, &mut kp_big);
    }
    let target = PeerId::from_bytes([42u8; 32]);

    let flag = Arc::new(AtomicBool::new(true));
    let (mgr_small, mut ev_small, store_small, _) =
        spawn_manager(kp_small.clone(), flag.clone());
    let (mgr_big, mut ev_big, store_big, _) = spawn_manager(kp_big.clone(), flag);

    let announce_small = mgr_small
        .propose(IntentAction::OpenChannel, target)
        .await
        .expect("small proposes");
    let announce_big = mgr_big
        .propose(IntentAction::OpenChannel, target)
        .await
        .expect("big proposes");

    // Cross-deliver the proposals.
    let outcome_at_small = mgr_small.observe_proposed(announce_big).await;
    assert_eq!(outcome_at_small, ObserveOutcome::LostTieBreak);
    match mgr_big.observe_proposed(announce_small).await {
        ObserveOutcome::LocalIntentDisplaced(displaced) => {
            assert_eq!(displaced.initiator, kp_big.peer_id());
        }
        other => panic!("expected displacement at the larger key, got {other:?}"),
    }

    // The loser aborts explicitly...
    match next_event(&mut ev_big).await {
        IntentEvent::LocalAborted { announce, .. } => {
            assert_eq!(announce.initiator, kp_big.peer_id());
        }
        other => panic!("expected abort at loser, got {other:?}"),
    }
    // ...and the winner commits after its hold period, durably.
    match next_event(&mut ev_small).await {
        IntentEvent::LocalCommitted(announce) => {
            assert_eq!(announce.initiator, kp_small.peer_id());
            assert_eq!(announce.target, target);
        }
        other => panic!("expected commit at winner, got {other:?}"),
    }
    assert_eq!(store_small.intents().await.len(), 1);
    assert!(store_big.intents().await.is_empty());

    mgr_small.quit().await;
    mgr_big.quit().await;
}

#[tokio::test]
async fn replaying_a_committed_proposal_is_a_noop() {
    let kp = Keypair::generate();
    let observer_kp = Keypair::generate();
    let flag = Arc::new(AtomicBool::new(true));
    let (manager, mut events, _store, _rpc) = spawn_manager(observer_kp, flag);

    let target = PeerId::from_bytes([7u8; 32]);
    let announce = make_announce(&kp, IntentAction::BanPeer, target);

    assert_eq!(
        manager.observe_proposed(announce.clone()).await,
        ObserveOutcome::Tracked
    );
    // Remote intent commits quietly after its hold period.
    match next_event(&mut events).await {
        IntentEvent::RemoteCommitted(committed) => {
            assert_eq!(committed.target, target);
        }
        other => panic!("expected remote commit, got {other:?}"),
    }

    // The identical proposal replayed: rejected, no pending intent, no
    // further events.
    assert_eq!(
        manager.observe_proposed(announce.clone()).await,
        ObserveOutcome::ReplayRejected
    );
    assert!(manager.pending().await.is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(400), events.recv())
            .await
            .is_err(),
        "replay must not produce another event"
    );

    manager.quit().await;
}

#[tokio::test]
async fn gate_toggled_false_at_decision_time_blocks_durable_commit() {
    let kp = Keypair::generate();
    let flag = Arc::new(AtomicBool::new(true));
    let (manager, mut events, store, rpc) = spawn_manager(kp, flag.clone());

    let target = PeerId::from_bytes([9u8; 32]);
    manager
        .propose(IntentAction::PromoteMember, target)
        .await
        .expect("propose");

    // Flip the gate off while the intent is held, before the deadline.
    flag.store(false, Ordering::SeqCst);

    match next_event(&mut events).await {
        IntentEvent::LocalAborted { announce, .. } => {
            assert_eq!(announce.target, target);
        }
        other => panic!("expected gate abort, got {other:?}"),
    }
    // No committed record is observable in durable state.
    assert!(store.intents().await.is_empty());
    // An explicit abort notice was broadcast (after the initial proposal).
    let aborted_sent = rpc.sent().await.iter().any(|(_, frame)| {
        matches!(frame.payload, FramePayload::IntentAborted { .. })
    });
    assert!(aborted_sent, "abort notice must be broadcast");

    manager.quit().await;
}

#[tokio::test]
async fn store_outage_degrades_but_does_not_block_commit() {
    struct FailingStore;

    #[async_trait]
    impl DurableStore for FailingStore {
        async fn get_member(
            &self,
            _peer_id: PeerId,
        ) -> Result<Option<apiary::membership::MembershipRecord>, StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn upsert_state_entry(
            &self,
            _entry: apiary::wire::StateEntry,
        ) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
        async fn record_intent(&self, _intent: IntentRow) -> Result<(), StoreError> {
            Err(StoreError::Backend("down".into()))
        }
    }

    let kp = Keypair::generate();
    let rpc = Arc::new(RecordingRpc::default());
    let gate = Arc::new(|_: &apiary::wire::IntentAnnounce| true);
    let (manager, mut events) = IntentManager::spawn(
        kp,
        rpc,
        Arc::new(FailingStore),
        gate,
        fast_config(),
    );

    let target = PeerId::from_bytes([11u8; 32]);
    manager
        .propose(IntentAction::OpenChannel, target)
        .await
        .expect("propose");

    // The commit still lands despite the store being down: the engine
    // degrades rather than stalling the protocol loop.
    match next_event(&mut events).await {
        IntentEvent::LocalCommitted(announce) => assert_eq!(announce.target, target),
        other => panic!("expected commit despite store outage, got {other:?}"),
    }

    manager.quit().await;
}
