//! Derived board cache: a live nibble-packed board plus the most recently
//! materialized snapshot.
//!
//! ```text
//!  set_pixel ──CAS──► PackedBoard ──to_snapshot──► BoardSnapshot (≤ max_age old)
//!                          ▲
//!  rebuild_from(log) ──────┘ built out of place, swapped in whole
//! ```
//!
//! Losing the cache never loses data: [`build_board`] reproduces it from
//! the durable log alone.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use place_core::{
    snapshot_timestamp, BoardDims, BoardSnapshot, CodecError, Color, Grid, PackedBoard,
    PixelRecord,
};

use crate::storage::{DurableLog, StoreError};

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Placements read from the log.
    pub scanned: u64,
    /// Cells that ended up with a placement.
    pub cells_set: u64,
    /// Placements outside the current board bounds.
    pub skipped_out_of_bounds: u64,
    /// Placements whose color does not fit a cell.
    pub skipped_bad_color: u64,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub materializations: u64,
    pub rebuilds: u64,
}

#[derive(Default)]
struct AtomicCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    materializations: AtomicU64,
    rebuilds: AtomicU64,
}

struct Materialized {
    snapshot: Arc<BoardSnapshot>,
    at: Instant,
}

/// Scan the whole log and resolve the winning color of every cell.
///
/// Last write wins by timestamp, ties by placement id, so the result does
/// not depend on scan order.
pub fn build_board(
    log: &dyn DurableLog,
    dims: BoardDims,
) -> Result<(Grid, RebuildReport), StoreError> {
    let mut report = RebuildReport::default();
    let winners = latest_per_cell(log, dims, None, &mut report)?;

    let mut grid = Grid::new(dims);
    for record in winners.into_iter().flatten() {
        match grid.set(record.x, record.y, record.color) {
            Ok(()) => report.cells_set += 1,
            Err(e) => {
                log::warn!("skipping placement {} during rebuild: {e}", record.id);
                report.skipped_bad_color += 1;
            }
        }
    }

    Ok((grid, report))
}

/// Winning record per cell among placements made at or after `since`
/// (all placements when `None`).
fn latest_per_cell(
    log: &dyn DurableLog,
    dims: BoardDims,
    since: Option<DateTime<Utc>>,
    report: &mut RebuildReport,
) -> Result<Vec<Option<PixelRecord>>, StoreError> {
    let mut winners: Vec<Option<PixelRecord>> = vec![None; dims.cell_count()];

    for record in log.scan_all() {
        let record = record?;
        if since.is_some_and(|since| record.created_at < since) {
            continue;
        }
        report.scanned += 1;

        if record.x >= dims.width || record.y >= dims.height {
            report.skipped_out_of_bounds += 1;
            continue;
        }
        let slot = &mut winners[dims.offset(record.x, record.y)];
        if slot.as_ref().is_none_or(|current| record.supersedes(current)) {
            *slot = Some(record);
        }
    }

    Ok(winners)
}

/// Process-wide board cache. Safe to share behind an `Arc`.
pub struct SnapshotCache {
    dims: BoardDims,
    max_age: Duration,
    board: RwLock<Option<Arc<PackedBoard>>>,
    materialized: RwLock<Option<Materialized>>,
    stats: AtomicCacheStats,
    /// Held for the whole scan-and-swap so rebuilds never overlap.
    rebuild_lock: Mutex<()>,
}

impl SnapshotCache {
    /// An empty cache. Reads miss until it is rebuilt or warmed.
    pub fn new(dims: BoardDims, max_age: Duration) -> Self {
        Self {
            dims,
            max_age,
            board: RwLock::new(None),
            materialized: RwLock::new(None),
            stats: AtomicCacheStats::default(),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn dims(&self) -> BoardDims {
        self.dims
    }

    pub async fn is_populated(&self) -> bool {
        self.board.read().await.is_some()
    }

    /// Cached snapshot, re-materialized once it is older than `max_age`.
    /// `None` if the cache was never populated or has been invalidated.
    pub async fn get_snapshot(&self) -> Option<Arc<BoardSnapshot>> {
        {
            let materialized = self.materialized.read().await;
            if let Some(m) = materialized.as_ref() {
                if m.at.elapsed() < self.max_age {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(m.snapshot.clone());
                }
            }
        }

        let snapshot = self.get_full_snapshot(Utc::now()).await;
        if snapshot.is_none() {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        snapshot
    }

    /// Materialize a fresh snapshot from the live board stamped with `now`.
    pub async fn get_full_snapshot(&self, now: DateTime<Utc>) -> Option<Arc<BoardSnapshot>> {
        let board = self.board.read().await.clone()?;
        let snapshot = Arc::new(board.to_snapshot(snapshot_timestamp(now)));
        self.stats.materializations.fetch_add(1, Ordering::Relaxed);

        *self.materialized.write().await = Some(Materialized {
            snapshot: snapshot.clone(),
            at: Instant::now(),
        });
        Some(snapshot)
    }

    /// Best-effort single-cell update of the live board.
    ///
    /// Returns `Ok(false)` when there is no board to update; the next
    /// rebuild picks the placement up from the log instead.
    pub async fn set_pixel(&self, x: u32, y: u32, color: Color) -> Result<bool, CodecError> {
        let board = self.board.read().await;
        match board.as_ref() {
            Some(board) => board.set(x, y, color).map(|()| true),
            None => Ok(false),
        }
    }

    /// Current color of one cell according to the cache.
    pub async fn get_pixel(&self, x: u32, y: u32) -> Option<Color> {
        self.board.read().await.as_ref()?.get(x, y)
    }

    /// Rebuild from the durable log and swap the result in.
    pub async fn rebuild_from(&self, log: &dyn DurableLog) -> Result<RebuildReport, StoreError> {
        let _guard = self.rebuild_lock.lock().await;
        self.rebuild_locked(log).await
    }

    /// Rebuild only if nothing is installed. Callers that lose the race
    /// wait for the winner's board instead of scanning again.
    pub async fn rebuild_if_empty(
        &self,
        log: &dyn DurableLog,
    ) -> Result<Option<RebuildReport>, StoreError> {
        let _guard = self.rebuild_lock.lock().await;
        if self.is_populated().await {
            return Ok(None);
        }
        self.rebuild_locked(log).await.map(Some)
    }

    async fn rebuild_locked(&self, log: &dyn DurableLog) -> Result<RebuildReport, StoreError> {
        let started = Instant::now();
        let (grid, report) = build_board(log, self.dims)?;
        let board = PackedBoard::from_grid(&grid)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        self.install(board).await;
        log::info!(
            "rebuilt {} cache from {} placements in {:?} ({} out of bounds)",
            self.dims,
            report.scanned,
            started.elapsed(),
            report.skipped_out_of_bounds
        );
        Ok(report)
    }

    /// Replace the live board wholesale. Readers see the old board or the
    /// new one, never a mix.
    pub async fn install(&self, board: PackedBoard) {
        let board = Arc::new(board);
        *self.board.write().await = Some(board);
        *self.materialized.write().await = None;
        self.stats.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    /// Restore from previously exported snapshot bytes.
    ///
    /// Fails if the bytes do not decode for this board; callers treat that
    /// as an inconsistent cache and rebuild from the log.
    pub async fn warm_from_bytes(&self, bytes: &[u8]) -> Result<u32, CodecError> {
        let (timestamp, board) = PackedBoard::from_snapshot(self.dims, bytes)?;
        let _guard = self.rebuild_lock.lock().await;
        self.install(board).await;
        Ok(timestamp)
    }

    /// Apply placements made at or after `since` (snapshot seconds) on top
    /// of the installed board, last write wins per cell. Brings a board
    /// warmed from an older export up to date with the log.
    pub async fn catch_up(
        &self,
        log: &dyn DurableLog,
        since: u32,
    ) -> Result<RebuildReport, StoreError> {
        let _guard = self.rebuild_lock.lock().await;
        let since = DateTime::from_timestamp(i64::from(since), 0).unwrap_or_default();
        let mut report = RebuildReport::default();
        let winners = latest_per_cell(log, self.dims, Some(since), &mut report)?;

        let board = self.board.read().await.clone();
        let Some(board) = board else {
            return Ok(report);
        };
        for record in winners.into_iter().flatten() {
            match board.set(record.x, record.y, record.color) {
                Ok(()) => report.cells_set += 1,
                Err(e) => {
                    log::warn!("skipping placement {} during catch-up: {e}", record.id);
                    report.skipped_bad_color += 1;
                }
            }
        }
        *self.materialized.write().await = None;
        log::info!("caught up {} cells from {} newer placements", report.cells_set, report.scanned);
        Ok(report)
    }

    /// Drop everything. Subsequent reads miss until the next rebuild.
    pub async fn invalidate(&self) {
        *self.board.write().await = None;
        *self.materialized.write().await = None;
        log::debug!("snapshot cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            materializations: self.stats.materializations.load(Ordering::Relaxed),
            rebuilds: self.stats.rebuilds.load(Ordering::Relaxed),
        }
    }
}
