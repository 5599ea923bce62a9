//! Durable-store collaborator interface.
//!
//! The coordination engine persists membership records, state entries, and
//! committed intents through this trait. Calls look synchronous to the
//! protocol but must never interleave on one underlying handle from
//! different loops — [`SerializedStore`] enforces that with an explicit
//! serialization primitive rather than sharing a handle unguarded. Every
//! call carries a bounded timeout: a stalled store degrades the engine
//! (`StoreError::Timeout`), it does not stall the coordination loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::identity::PeerId;
use crate::intent::IntentState;
use crate::membership::MembershipRecord;
use crate::wire::{IntentAction, StateEntry};

/// Default per-call timeout for store operations.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Call exceeded its bounded timeout.
    Timeout,
    /// Backend reported a failure.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store call timed out"),
            StoreError::Backend(msg) => write!(f, "store backend: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// A committed (or aborted) intent as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentRow {
    pub action: IntentAction,
    pub target: PeerId,
    pub initiator: PeerId,
    pub proposed_at: u64,
    pub state: IntentState,
}

/// The durable-store operations the engine consumes.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn get_member(&self, peer_id: PeerId) -> Result<Option<MembershipRecord>, StoreError>;

    async fn upsert_state_entry(&self, entry: StateEntry) -> Result<(), StoreError>;

    async fn record_intent(&self, intent: IntentRow) -> Result<(), StoreError>;
}

/// In-process store. Each table sits behind its own mutex; lock scope is
/// the map operation only.
pub struct MemoryStore {
    members: Mutex<HashMap<PeerId, MembershipRecord>>,
    entries: Mutex<HashMap<PeerId, StateEntry>>,
    intents: Mutex<Vec<IntentRow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            intents: Mutex::new(Vec::new()),
        }
    }

    pub async fn put_member(&self, record: MembershipRecord) {
        self.members.lock().await.insert(record.peer_id, record);
    }

    pub async fn intents(&self) -> Vec<IntentRow> {
        self.intents.lock().await.clone()
    }

    pub async fn entry_count(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get_member(&self, peer_id: PeerId) -> Result<Option<MembershipRecord>, StoreError> {
        Ok(self.members.lock().await.get(&peer_id).cloned())
    }

    async fn upsert_state_entry(&self, entry: StateEntry) -> Result<(), StoreError> {
        self.entries.lock().await.insert(entry.peer_id, entry);
        Ok(())
    }

    async fn record_intent(&self, intent: IntentRow) -> Result<(), StoreError> {
        self.intents.lock().await.push(intent);
        Ok(())
    }
}

/// Wraps any store so that concurrent calls from different loops are
/// serialized onto the underlying handle, and each call carries a bounded
/// timeout.
pub struct SerializedStore<S> {
    inner: Arc<S>,
    serial: Mutex<()>,
    timeout: Duration,
}

impl<S: DurableStore> SerializedStore<S> {
    pub fn new(inner: Arc<S>) -> Self {
        Self::with_timeout(inner, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(inner: Arc<S>, timeout: Duration) -> Self {
        Self {
            inner,
            serial: Mutex::new(()),
            timeout,
        }
    }
}

#[async_trait]
impl<S: DurableStore> DurableStore for SerializedStore<S> {
    async fn get_member(&self, peer_id: PeerId) -> Result<Option<MembershipRecord>, StoreError> {
        let _guard = self.serial.lock().await;
        tokio::time::timeout(self.timeout, self.inner.get_member(peer_id))
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn upsert_state_entry(&self, entry: StateEntry) -> Result<(), StoreError> {
        let _guard = self.serial.lock().await;
        tokio::time::timeout(self.timeout, self.inner.upsert_state_entry(entry))
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn record_intent(&self, intent: IntentRow) -> Result<(), StoreError> {
        let _guard = self.serial.lock().await;
        tokio::time::timeout(self.timeout, self.inner.record_intent(intent))
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}
