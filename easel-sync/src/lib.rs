//! # easel-sync — Multi-client synchronization for Easel documents
//!
//! Session-oriented replication of a record store between one server-held
//! authority and many concurrently editing clients.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────┐
//! │  SyncClient  │ ◄──────────────────► │  SyncServer  │
//! │ ClientSession│     binary proto     │   (rooms)    │
//! └──────┬───────┘                      └──────┬───────┘
//!        │                                     │
//!        ▼                                     ▼
//! ┌──────────────┐                      ┌──────────────┐
//! │ Store (local)│                      │   SyncRoom   │
//! │  optimistic  │                      │ (authority)  │
//! └──────────────┘                      └──────┬───────┘
//!                                              │
//!                                  ┌───────────┼───────────┐
//!                                  ▼           ▼           ▼
//!                            BroadcastGroup  Storage   field stamps
//!                             (fan-out)   (snap+log)     (LWW)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — bincode message envelope with JSON record payloads
//! - [`room`] — server-side per-document coordinator (transport-free)
//! - [`client`] — client state machine plus WebSocket wrapper
//! - [`broadcast`] — room fan-out with backpressure
//! - [`server`] — WebSocket server, rooms, persistence hooks
//! - [`storage`] — snapshot + diff-log durability
//!
//! Clients bootstrap from a snapshot, stream diffs in epoch order, and
//! push optimistic mutations tagged with their base epoch; the room
//! resolves conflicts per-field (last-writer-wins on `(epoch, client)`)
//! and re-broadcasts the outcome to everyone, originator included.
//! Presence rides a parallel ephemeral channel and is evicted on
//! disconnect or heartbeat timeout.

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{
    ClientEvent, ClientOutput, ClientSession, PendingPush, SessionState, SyncClient,
};
pub use protocol::{
    CloseReason, NackReason, ProtocolError, PushOrigin, SyncError, SyncMessage, WireDiff,
    WireRecord, PROTOCOL_VERSION,
};
pub use room::{Outbound, RoomConfig, RoomStats, SyncRoom};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{DocumentStorage, SnapshotFile, StorageConfig, StorageError};
