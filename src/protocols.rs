//! Protocol trait definitions abstracting the frame transport.
//!
//! Engines (state manager, relay layer, intent manager) depend on these
//! traits rather than on the QUIC transport directly, so protocol logic is
//! testable against in-memory stubs and the transport can be swapped
//! without touching the engines.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::PeerId;
use crate::wire::Frame;

/// Outbound frame delivery toward authenticated members.
#[async_trait]
pub trait HiveBroadcast: Send + Sync + 'static {
    /// Send a frame to every connected authenticated member.
    async fn broadcast(&self, frame: Frame) -> Result<()>;

    /// Send a frame to every connected authenticated member except one
    /// (the relay path: never echo a frame back at its origin).
    async fn broadcast_except(&self, frame: Frame, except: PeerId) -> Result<()>;

    /// Send a frame to one specific peer.
    async fn send_to(&self, to: PeerId, frame: Frame) -> Result<()>;
}

/// In-memory transport stub used by unit and integration tests.
///
/// Records every outbound frame so tests can assert on what an engine
/// emitted without sockets.
pub mod testing {
    use super::*;
    use tokio::sync::Mutex;

    /// Destination of a recorded send.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SentTo {
        All,
        AllExcept(PeerId),
        One(PeerId),
    }

    #[derive(Default)]
    pub struct RecordingRpc {
        sent: Mutex<Vec<(SentTo, Frame)>>,
    }

    impl RecordingRpc {
        pub async fn sent(&self) -> Vec<(SentTo, Frame)> {
            self.sent.lock().await.clone()
        }

        pub async fn sent_count(&self) -> usize {
            self.sent.lock().await.len()
        }

        pub async fn clear(&self) {
            self.sent.lock().await.clear();
        }
    }

    #[async_trait]
    impl HiveBroadcast for RecordingRpc {
        async fn broadcast(&self, frame: Frame) -> Result<()> {
            self.sent.lock().await.push((SentTo::All, frame));
            Ok(())
        }

        async fn broadcast_except(&self, frame: Frame, except: PeerId) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((SentTo::AllExcept(except), frame));
            Ok(())
        }

        async fn send_to(&self, to: PeerId, frame: Frame) -> Result<()> {
            self.sent.lock().await.push((SentTo::One(to), frame));
            Ok(())
        }
    }
}
