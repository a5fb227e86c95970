//! Durable placement log: the single source of truth for the board.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   append (one atomic batch)   ┌────────────────────────────────┐
//! │ PlacementService │ ────────────────────────────► │ DurableLog                     │
//! └──────────────────┘                               │                                │
//!                                                    │ placements  id     → record    │
//!                                                    │ pixels      (x,y)  → latest    │
//!                                                    │ actors      actor  → last time │
//!                                                    └───────────────┬────────────────┘
//!                                                                    │ scan_all
//!                                                                    ▼
//!                                                            SnapshotCache rebuild
//! ```
//!
//! Both derived views are updated inside the same write as the placement
//! itself and resolve conflicts by timestamp, so an actor's own placement
//! is visible to its very next cooldown check.

pub mod memory;
pub mod rocks;

pub use memory::MemoryLog;
pub use rocks::{RocksLog, StoreConfig};

use chrono::{DateTime, Utc};
use place_core::{ActorId, Color, PixelRecord, Placement, PlacementId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Lazy full scan of every placement ever appended.
pub type PlacementScan<'a> = Box<dyn Iterator<Item = Result<PixelRecord, StoreError>> + 'a>;

/// Authoritative, append-only placement storage.
///
/// Implementations must be safe to call concurrently; callers never lock.
pub trait DurableLog: Send + Sync {
    /// Durably store one placement. Never overwrites or merges records.
    fn append(&self, placement: &Placement) -> Result<PlacementId, StoreError>;

    /// Store many placements atomically: either all become visible or none.
    fn append_batch(&self, placements: &[Placement]) -> Result<Vec<PlacementId>, StoreError>;

    /// Most recent placement at a coordinate, by timestamp.
    fn get_current_placement(&self, x: u32, y: u32) -> Result<Option<Placement>, StoreError>;

    fn get_current_color(&self, x: u32, y: u32) -> Result<Option<Color>, StoreError> {
        Ok(self.get_current_placement(x, y)?.map(|p| p.color))
    }

    /// Time of the actor's most recent placement.
    fn get_last_placement_time(&self, actor: &ActorId)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Every placement in storage order. Consumers resolve last-write-wins
    /// by timestamp; scan order carries no meaning.
    fn scan_all(&self) -> PlacementScan<'_>;

    fn placement_count(&self) -> Result<u64, StoreError>;
}

pub(crate) fn encode_placement(placement: &Placement) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(placement, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub(crate) fn decode_placement(bytes: &[u8]) -> Result<Placement, StoreError> {
    let (placement, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(placement)
}

/// Pixel view key: x then y, both big-endian, independent of board width.
pub(crate) fn coord_key(x: u32, y: u32) -> [u8; 8] {
    let mut key = [0u8; 8];
    key[..4].copy_from_slice(&x.to_be_bytes());
    key[4..].copy_from_slice(&y.to_be_bytes());
    key
}
