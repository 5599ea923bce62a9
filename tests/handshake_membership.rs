//! Integration tests for the node-level handshake and membership flows.
//!
//! These drive two real nodes over loopback QUIC: ticketed admission,
//! state sync after join, vouch-driven promotion through the intent lock,
//! and rejection of unticketed strangers.

use std::time::Duration;

use apiary::{HiveConfig, HiveNode, PeerProfile, Tier};

/// Poll until `check` passes or the timeout elapses.
async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Config tuned for test pacing: tiny quorum, fast intent sweeps, frequent
/// gossip pushes.
fn fast_config() -> HiveConfig {
    let mut config = HiveConfig::new();
    config.membership.min_quorum = 1;
    config.intent.hold_period = Duration::from_millis(200);
    config.intent.sweep_interval = Duration::from_millis(25);
    config.state.push_interval = Duration::from_secs(2);
    config.state.push_jitter = Duration::from_millis(500);
    config
}

fn profile(capacity: u64) -> PeerProfile {
    PeerProfile {
        capacity_msat: capacity,
        fee_base_msat: 1_000,
        fee_rate_ppm: 100,
        uptime_ppm: 990_000,
        addrs: vec![],
        topology_hints: vec![],
    }
}

#[tokio::test]
async fn ticketed_join_and_state_sync() {
    let founder = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("founder bind");
    founder.bootstrap_genesis().await;
    founder
        .update_profile(profile(5_000_000))
        .await
        .expect("founder profile");

    let joiner = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("joiner bind");
    let ticket = founder.issue_ticket(joiner.peer_id()).await;

    joiner
        .join(founder.peer_id(), founder.local_addr(), ticket)
        .await
        .expect("join");

    // The founder admits the joiner as a neophyte.
    let joiner_id = joiner.peer_id();
    wait_for("founder to admit joiner", || async {
        founder
            .members()
            .await
            .iter()
            .any(|r| r.peer_id == joiner_id && r.tier == Tier::Neophyte)
    })
    .await;

    // The joiner's sync pulls the founder's roster and state entry.
    let founder_id = founder.peer_id();
    wait_for("joiner to sync founder state", || async {
        joiner
            .state_snapshot()
            .await
            .iter()
            .any(|e| e.peer_id == founder_id)
    })
    .await;
    assert_eq!(joiner.status().await.total_capacity_msat, 5_000_000);

    // The joiner's own profile gossips back to the founder.
    joiner
        .update_profile(profile(2_000_000))
        .await
        .expect("joiner profile");
    wait_for("founder to merge joiner entry", || async {
        founder
            .state_snapshot()
            .await
            .iter()
            .any(|e| e.peer_id == joiner_id)
    })
    .await;
    assert_eq!(founder.status().await.total_capacity_msat, 7_000_000);

    joiner.shutdown().await;
    founder.shutdown().await;
}

#[tokio::test]
async fn vouch_promotes_neophyte_through_intent_lock() {
    let founder = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("founder bind");
    founder.bootstrap_genesis().await;

    let joiner = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("joiner bind");
    let ticket = founder.issue_ticket(joiner.peer_id()).await;
    joiner
        .join(founder.peer_id(), founder.local_addr(), ticket)
        .await
        .expect("join");

    let joiner_id = joiner.peer_id();
    wait_for("admission", || async {
        founder.members().await.iter().any(|r| r.peer_id == joiner_id)
    })
    .await;

    // One vouch meets the floor quorum of the test config; the promote
    // intent holds briefly, commits, and the promotion broadcast follows.
    let request_id = joiner.request_promotion().await.expect("request promotion");
    founder
        .vouch_for(joiner_id, request_id)
        .await
        .expect("vouch");

    wait_for("founder-side promotion", || async {
        founder
            .members()
            .await
            .iter()
            .any(|r| r.peer_id == joiner_id && r.tier == Tier::Member)
    })
    .await;
    wait_for("joiner-side promotion", || async {
        joiner
            .members()
            .await
            .iter()
            .any(|r| r.peer_id == joiner_id && r.tier == Tier::Member)
    })
    .await;

    joiner.shutdown().await;
    founder.shutdown().await;
}

#[tokio::test]
async fn stranger_without_valid_ticket_stays_out() {
    let founder = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("founder bind");
    founder.bootstrap_genesis().await;
    founder
        .update_profile(profile(9_000_000))
        .await
        .expect("profile");

    // The stranger presents a self-issued ticket: its issuer is not a
    // member of the founder's hive, so the handshake is rejected.
    let stranger = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("stranger bind");
    let forged = stranger.issue_ticket(stranger.peer_id()).await;
    stranger
        .join(founder.peer_id(), founder.local_addr(), forged)
        .await
        .expect("dial itself succeeds");

    // Give the handshake time to run and fail.
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let stranger_id = stranger.peer_id();
    assert!(
        !founder
            .members()
            .await
            .iter()
            .any(|r| r.peer_id == stranger_id),
        "stranger must not be admitted"
    );
    // And its unauthenticated frames never reach the state map.
    assert!(
        !founder
            .state_snapshot()
            .await
            .iter()
            .any(|e| e.peer_id == stranger_id),
        "stranger state must not merge"
    );

    stranger.shutdown().await;
    founder.shutdown().await;
}

#[tokio::test]
async fn member_rehandshake_needs_no_ticket() {
    let founder = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("founder bind");
    founder.bootstrap_genesis().await;

    let joiner = HiveNode::bind("127.0.0.1:0", fast_config())
        .await
        .expect("joiner bind");
    let ticket = founder.issue_ticket(joiner.peer_id()).await;
    joiner
        .join(founder.peer_id(), founder.local_addr(), ticket.clone())
        .await
        .expect("first join");

    let joiner_id = joiner.peer_id();
    wait_for("first admission", || async {
        founder.members().await.iter().any(|r| r.peer_id == joiner_id)
    })
    .await;

    // Handshake again with the same identity. The staged ticket is already
    // spent, but a known peer re-handshakes without redeeming one.
    joiner
        .join(founder.peer_id(), founder.local_addr(), ticket)
        .await
        .expect("re-join");

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    // Still exactly one record for the joiner, still present.
    let records: Vec<_> = founder
        .members()
        .await
        .into_iter()
        .filter(|r| r.peer_id == joiner_id)
        .collect();
    assert_eq!(records.len(), 1);

    joiner.shutdown().await;
    founder.shutdown().await;
}
