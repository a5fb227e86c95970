//! # place-collab — shared pixel canvas service
//!
//! Accepts placements from many actors, records every one durably, keeps a
//! packed board in memory for cheap full-board reads and pushes each change
//! to live viewers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   draw / draw-rect   ┌──────────────────┐
//! │ ViewerServer│ ───────────────────► │ PlacementService │
//! │ (WebSocket) │ ◄── board bitmap ─── │  CooldownPolicy  │
//! └──────▲──────┘                      └───┬─────┬─────┬──┘
//!        │                                 │     │     │
//!        │                                 ▼     ▼     ▼
//! ┌──────┴──────┐                 ┌──────────┐ ┌─────────────┐
//! │ BroadcastBus│ ◄── place ───── │DurableLog│ │SnapshotCache│
//! │ (fan-out)   │                 │ (RocksDB)│ │ (packed)    │
//! └─────────────┘                 └──────────┘ └─────────────┘
//! ```
//!
//! The log is the source of truth. The cache and the broadcast are
//! best-effort and may be rebuilt or missed without losing a placement.
//!
//! ## Modules
//!
//! - [`storage`] — durable placement log (RocksDB and in-memory)
//! - [`cache`] — live packed board and log replay
//! - [`cooldown`] — eligibility and per-actor rate limiting
//! - [`service`] — placement workflow and board reads
//! - [`protocol`] — JSON wire events and viewer requests
//! - [`broadcast`] — namespace fan-out with lagging receivers
//! - [`activity`] — periodic viewer count
//! - [`api`] — status codes, bodies and cache headers per endpoint
//! - [`server`] — WebSocket viewer server

pub mod activity;
pub mod api;
pub mod broadcast;
pub mod cache;
pub mod cooldown;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;

// Re-exports for convenience
pub use api::{ApiBody, ApiResponse, BoardTier};
pub use broadcast::{BroadcastBus, BroadcastGroup, BroadcastStats, Frame, Subscriber};
pub use cache::{build_board, CacheStats, RebuildReport, SnapshotCache};
pub use cooldown::CooldownPolicy;
pub use protocol::{BroadcastEvent, ClientRequest, ProtocolError};
pub use server::{ServerConfig, ServerStats, ViewerServer};
pub use service::{
    BoardRead, BoardSource, Placed, PlacementService, PlacementStage, RectanglePlaced,
    WarmOutcome,
};
pub use storage::{DurableLog, MemoryLog, RocksLog, StoreConfig, StoreError};
