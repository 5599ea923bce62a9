//! # Apiary - Hive Coordination Engine
//!
//! Apiary coordinates a fleet of independently-operated payment-routing
//! nodes ("the hive") into a cooperative unit without a central
//! coordinator:
//!
//! - **Identity**: Ed25519-based cryptographic identities (32-byte public keys)
//! - **Handshake**: challenge/response admission with signed, single-use
//!   invitation tickets and short-lived session attestations
//! - **Gossip**: eventually-consistent shared state (capacity, fee policy,
//!   uptime, topology hints) with digest-driven anti-entropy
//! - **Intent locks**: optimistic distributed mutual exclusion so costly
//!   actions (channel opens, bans, promotions) happen exactly once
//! - **Transport**: QUIC with mutual TLS bound to raw Ed25519 identities
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** throughout for safe concurrent
//! state:
//! - Each component (membership, handshake, state, relay, intents,
//!   transport) has a public Handle and a private Actor
//! - Handles are cheap to clone and communicate via async channels
//! - Actors own all mutable state and process commands sequentially
//!
//! ## Security Model
//!
//! - All peer connections use mutual TLS with Ed25519 certificates;
//!   Identity = Public Key
//! - Admission requires a valid ticket signed by an existing member;
//!   tickets are size-capped, single-use, and expiring
//! - Every signed structure uses a unique domain-separation prefix and one
//!   canonical byte encoding shared by signer and verifiers
//! - Rate limiting and bounded caches (challenges, seen-frames, used
//!   tickets, rate windows, connections) prevent resource exhaustion
//! - A misbehaving peer can cost dropped frames and bandwidth, never a
//!   crash or unbounded growth
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API combining all components |
//! | `identity` | Keypairs and `PeerId` identities |
//! | `crypto` | Domain-separated signing and verification |
//! | `wire` | Frame envelope and bounded message codec |
//! | `membership` | Tiers, tickets, vouches, promotion quorum |
//! | `handshake` | Challenge/response engine and attestations |
//! | `state` | HiveMap gossip core with monotonic merge |
//! | `relay` | Re-broadcast suppression via fingerprint cache |
//! | `intent` | Distributed intent locks with gated commit |
//! | `store` | Durable-store collaborator interface |
//! | `bridge` | Fee-policy collaborator behind a circuit breaker |
//! | `transport` | QUIC mutual-TLS frame transport |
//! | `protocols` | Transport traits for engine/test decoupling |

pub mod bridge;
pub mod crypto;
pub mod handshake;
pub mod identity;
pub mod intent;
pub mod membership;
pub mod node;
pub mod protocols;
pub mod relay;
pub mod state;
pub mod store;
pub mod transport;
pub mod wire;

pub use identity::{Keypair, PeerId};
pub use membership::{MembershipRecord, Ticket, Tier};
pub use node::{HiveConfig, HiveNode, NodeStatus, PROTOCOL_VERSION};
pub use wire::{IntentAction, PeerProfile};
