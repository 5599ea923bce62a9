//! # Fee-Policy Bridge with Circuit Breaker
//!
//! Committed intents can carry policy-gated side effects that land on a
//! sibling fee-management service (e.g. applying a fee-zero policy to a
//! newly promoted member). That service is an external collaborator: it
//! can stall or fail, and the coordination engine must keep running in a
//! degraded local-decision-only mode rather than block on it.
//!
//! The breaker is the classic three-state machine:
//!
//! ```text
//! CLOSED --(failure_threshold consecutive failures)--> OPEN
//! OPEN   --(cooldown elapsed)---------------------> HALF-OPEN
//! HALF-OPEN --(success_threshold consecutive successes)--> CLOSED
//! HALF-OPEN --(any failure)-----------------------> OPEN
//! ```
//!
//! Recovery requires `success_threshold` (default 3) consecutive probe
//! successes, not one — a single-success reset flaps when the collaborator
//! is only intermittently healthy. Breaker state is a plain mutex held only
//! around the state transition itself, never across the outbound call.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::identity::{now_ms, PeerId};

// ============================================================================
// Bridge Interface
// ============================================================================

/// Fee policy to apply to a peer on the sibling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeePolicy {
    pub fee_base_msat: u64,
    pub fee_rate_ppm: u32,
}

impl FeePolicy {
    /// Zero-fee policy extended to hive members.
    pub const MEMBER_ZERO: FeePolicy = FeePolicy {
        fee_base_msat: 0,
        fee_rate_ppm: 0,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Breaker is open; the engine is operating without the collaborator.
    CircuitOpen,
    /// Call exceeded its bounded timeout.
    Timeout,
    /// Collaborator reported a failure.
    Backend(String),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::CircuitOpen => write!(f, "fee bridge circuit open"),
            BridgeError::Timeout => write!(f, "fee bridge call timed out"),
            BridgeError::Backend(msg) => write!(f, "fee bridge backend: {}", msg),
        }
    }
}

impl std::error::Error for BridgeError {}

/// The sibling fee-management service, consumed only for policy-gated side
/// effects of committed intents.
#[async_trait]
pub trait FeePolicyBridge: Send + Sync + 'static {
    async fn apply_fee_policy(&self, peer: PeerId, policy: FeePolicy) -> Result<(), BridgeError>;
}

#[async_trait]
impl FeePolicyBridge for Box<dyn FeePolicyBridge> {
    async fn apply_fee_policy(&self, peer: PeerId, policy: FeePolicy) -> Result<(), BridgeError> {
        (**self).apply_fee_policy(peer, policy).await
    }
}

/// Local-decision-only bridge for nodes run without the sibling service.
/// Every call succeeds without side effects.
pub struct NullBridge;

#[async_trait]
impl FeePolicyBridge for NullBridge {
    async fn apply_fee_policy(&self, _peer: PeerId, _policy: FeePolicy) -> Result<(), BridgeError> {
        Ok(())
    }
}

// ============================================================================
// Breaker Core (pure state machine)
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { since: u64 },
    HalfOpen { successes: u32 },
}

#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close. Hysteresis:
    /// deliberately more than one.
    pub success_threshold: u32,
    /// How long the breaker stays open before probing.
    pub cooldown: Duration,
    /// Bounded timeout per outbound call.
    pub call_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 3,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(5),
        }
    }
}

/// Pure breaker state machine. Callers hold its mutex only around these
/// methods, never across network awaits.
pub struct BreakerCore {
    state: CircuitState,
    consecutive_failures: u32,
    config: BreakerConfig,
}

impl BreakerCore {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            config,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may proceed now. An open breaker past its cooldown
    /// transitions to half-open and admits the probe.
    pub fn allow(&mut self, now: u64) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen { .. } => true,
            CircuitState::Open { since } => {
                if now.saturating_sub(since) >= self.config.cooldown.as_millis() as u64 {
                    self.state = CircuitState::HalfOpen { successes: 0 };
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        match self.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                } else {
                    self.state = CircuitState::HalfOpen { successes };
                }
            }
            CircuitState::Open { .. } => {}
        }
    }

    pub fn record_failure(&mut self, now: u64) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open { since: now };
                }
            }
            // Any half-open failure reopens immediately.
            CircuitState::HalfOpen { .. } => {
                self.consecutive_failures += 1;
                self.state = CircuitState::Open { since: now };
            }
            CircuitState::Open { .. } => {}
        }
    }

    /// Degraded when not fully closed.
    pub fn is_degraded(&self) -> bool {
        !matches!(self.state, CircuitState::Closed)
    }
}

// ============================================================================
// Breaker-Wrapped Bridge
// ============================================================================

/// Wraps any [`FeePolicyBridge`] in the circuit breaker. Clonable via Arc
/// by callers; breaker state is shared through the internal mutex.
pub struct BreakerBridge<B> {
    inner: B,
    core: Mutex<BreakerCore>,
    call_timeout: Duration,
}

impl<B: FeePolicyBridge> BreakerBridge<B> {
    pub fn new(inner: B, config: BreakerConfig) -> Self {
        let call_timeout = config.call_timeout;
        Self {
            inner,
            core: Mutex::new(BreakerCore::new(config)),
            call_timeout,
        }
    }

    /// Current breaker state, for the status surface.
    pub fn circuit_state(&self) -> CircuitState {
        self.core.lock().expect("breaker mutex poisoned").state()
    }

    /// Whether the engine is currently operating without the collaborator.
    pub fn is_degraded(&self) -> bool {
        self.core
            .lock()
            .expect("breaker mutex poisoned")
            .is_degraded()
    }
}

#[async_trait]
impl<B: FeePolicyBridge> FeePolicyBridge for BreakerBridge<B> {
    async fn apply_fee_policy(&self, peer: PeerId, policy: FeePolicy) -> Result<(), BridgeError> {
        let now = now_ms();
        let allowed = {
            // Lock held for the transition only, released before the call.
            let mut core = self.core.lock().expect("breaker mutex poisoned");
            core.allow(now)
        };
        if !allowed {
            debug!(peer = %peer.short_hex(), "fee bridge skipped: circuit open");
            return Err(BridgeError::CircuitOpen);
        }

        let result = tokio::time::timeout(
            self.call_timeout,
            self.inner.apply_fee_policy(peer, policy),
        )
        .await;

        let mut core = self.core.lock().expect("breaker mutex poisoned");
        match result {
            Ok(Ok(())) => {
                let was_degraded = core.is_degraded();
                core.record_success();
                if was_degraded && !core.is_degraded() {
                    info!("fee bridge recovered, circuit closed");
                }
                Ok(())
            }
            Ok(Err(e)) => {
                core.record_failure(now_ms());
                if matches!(core.state(), CircuitState::Open { .. }) {
                    warn!(error = %e, "fee bridge circuit opened");
                }
                Err(e)
            }
            Err(_) => {
                core.record_failure(now_ms());
                if matches!(core.state(), CircuitState::Open { .. }) {
                    warn!("fee bridge circuit opened after timeout");
                }
                Err(BridgeError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn core() -> BreakerCore {
        BreakerCore::new(BreakerConfig::default())
    }

    #[test]
    fn opens_after_consecutive_failures() {
        let mut core = core();
        let now = now_ms();
        core.record_failure(now);
        core.record_failure(now);
        assert_eq!(core.state(), CircuitState::Closed);
        core.record_failure(now);
        assert!(matches!(core.state(), CircuitState::Open { .. }));
        assert!(!core.allow(now));
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut core = core();
        let now = now_ms();
        core.record_failure(now);
        core.record_failure(now);
        core.record_success();
        core.record_failure(now);
        core.record_failure(now);
        // Streak was reset: still closed after two more failures.
        assert_eq!(core.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_cooldown() {
        let config = BreakerConfig {
            cooldown: Duration::from_millis(100),
            ..BreakerConfig::default()
        };
        let mut core = BreakerCore::new(config);
        let now = now_ms();
        for _ in 0..3 {
            core.record_failure(now);
        }
        assert!(!core.allow(now));
        // Cooldown elapsed: probe admitted, state half-open.
        assert!(core.allow(now + 200));
        assert!(matches!(core.state(), CircuitState::HalfOpen { .. }));
    }

    #[test]
    fn closing_requires_three_consecutive_successes() {
        let config = BreakerConfig {
            cooldown: Duration::from_millis(1),
            ..BreakerConfig::default()
        };
        let mut core = BreakerCore::new(config);
        let now = now_ms();
        for _ in 0..3 {
            core.record_failure(now);
        }
        assert!(core.allow(now + 10));

        core.record_success();
        assert!(matches!(core.state(), CircuitState::HalfOpen { successes: 1 }));
        core.record_success();
        assert!(matches!(core.state(), CircuitState::HalfOpen { successes: 2 }));
        core.record_success();
        assert_eq!(core.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_immediately() {
        let config = BreakerConfig {
            cooldown: Duration::from_millis(1),
            ..BreakerConfig::default()
        };
        let mut core = BreakerCore::new(config);
        let now = now_ms();
        for _ in 0..3 {
            core.record_failure(now);
        }
        assert!(core.allow(now + 10));
        core.record_success();
        core.record_success();
        // One failure before the third success: back to open, progress lost.
        core.record_failure(now + 20);
        assert!(matches!(core.state(), CircuitState::Open { .. }));
        assert!(!core.allow(now + 21));
    }

    struct FlakyBridge {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeePolicyBridge for FlakyBridge {
        async fn apply_fee_policy(
            &self,
            _peer: PeerId,
            _policy: FeePolicy,
        ) -> Result<(), BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BridgeError::Backend("unavailable".into()))
            }
        }
    }

    #[tokio::test]
    async fn breaker_bridge_degrades_and_recovers() {
        let inner = FlakyBridge {
            healthy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        };
        let config = BreakerConfig {
            failure_threshold: 3,
            success_threshold: 3,
            cooldown: Duration::from_millis(20),
            call_timeout: Duration::from_secs(1),
        };
        let bridge = BreakerBridge::new(inner, config);
        let peer = Keypair::generate().peer_id();

        // Three failures open the circuit.
        for _ in 0..3 {
            assert!(bridge
                .apply_fee_policy(peer, FeePolicy::MEMBER_ZERO)
                .await
                .is_err());
        }
        assert!(bridge.is_degraded());

        // While open, calls short-circuit without reaching the backend.
        let calls_before = bridge.inner.calls.load(Ordering::SeqCst);
        assert_eq!(
            bridge.apply_fee_policy(peer, FeePolicy::MEMBER_ZERO).await,
            Err(BridgeError::CircuitOpen)
        );
        assert_eq!(bridge.inner.calls.load(Ordering::SeqCst), calls_before);

        // Backend recovers; after the cooldown, three successful probes
        // close the circuit — not one.
        bridge.inner.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        for _ in 0..2 {
            bridge
                .apply_fee_policy(peer, FeePolicy::MEMBER_ZERO)
                .await
                .unwrap();
            assert!(bridge.is_degraded());
        }
        bridge
            .apply_fee_policy(peer, FeePolicy::MEMBER_ZERO)
            .await
            .unwrap();
        assert!(!bridge.is_degraded());
        assert_eq!(bridge.circuit_state(), CircuitState::Closed);
    }
}
