//! # Shardwatch
//!
//! High-availability membership tracking on top of a ZooKeeper-style
//! coordination service.
//!
//! Every monitored resource group (a cache shard, a database pair, ...) is a
//! node under a base path holding a JSON document with the group's current
//! master, its slaves and the members that are known but down. Shardwatch
//! mirrors those documents locally and answers lookups without a round-trip.
//!
//! This crate provides:
//! - **AvailabilityClient**: watches every group, serves master / round-robin
//!   slave lookups, and heals itself by reconnecting on session loss or on a
//!   lookup miss
//! - **AvailabilityPublisher**: the write side, for watchers publishing group
//!   states and availability votes
//! - **Consensus**: pure functions folding several observers' votes into one
//!   decision
//! - **Coordination**: the traits a coordination backend implements, plus a
//!   complete in-memory backend
//!
//! ## Architecture
//!
//! ```text
//!  ┌───────────────────────┐        ┌────────────────────────┐
//!  │  AvailabilityClient   │        │ AvailabilityPublisher  │
//!  │  (lookups, events)    │        │ (group states, votes)  │
//!  └──────────┬────────────┘        └───────────┬────────────┘
//!             │ Connector / CoordinationClient  │
//!             ▼                                 ▼
//!  ┌─────────────────────────────────────────────────────────┐
//!  │ coordination service   {base}/{group} = {"master", ...} │
//!  └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread: the client spawns its tasks with
//! `tokio::task::spawn_local` and must live inside a `LocalSet`.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

// =============================================================================
// Modules
// =============================================================================

/// The availability client and its connection state machine.
pub mod client;

/// Client configuration and reconnect timing.
pub mod config;

/// Vote aggregation across observers.
pub mod consensus;

/// Coordination service traits and the in-memory backend.
pub mod coordination;

/// Error types.
pub mod error;

/// Publishing group states and votes.
pub mod publisher;

/// Resource-group state documents.
pub mod state;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use client::{AvailabilityClient, ConnectionState, HaEvent, HaEventReceiver};
pub use config::{DEFAULT_BASE_PATH, DEFAULT_CONNECT_TIMEOUT, HaConfig, ReconnectPolicy};
pub use consensus::{Partition, Snapshot, aggregate, is_available};
pub use coordination::{
    Acl, Connector, CoordinationClient, CreateMode, InMemoryCoordination, InMemorySession,
    SessionEvent, SessionEvents, Watch, WatchEvent, WatchEventKind,
};
pub use error::{
    ConfigError, CoordinationError, CoordinationResult, PublishError, PublishResult,
};
pub use publisher::AvailabilityPublisher;
pub use state::{ResourceGroupState, Role};
