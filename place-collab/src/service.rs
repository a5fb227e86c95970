//! Placement service: validation, eligibility, cooldown, durable append,
//! cache update and broadcast for every write, plus the three board read
//! paths.
//!
//! Per-placement lifecycle:
//! ```text
//! Received ─► Validated ─► EligibilityChecked ─► CooldownChecked ─► Committed ─► Broadcast ─► Acknowledged
//!                 │                 │                    │
//!                 └─────────────────┴────────────────────┴──► Rejected(reason)
//! ```
//! Nothing is written before `Committed`. After it, cache and broadcast
//! failures are logged and the placement still succeeds.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use place_core::{
    encode, snapshot_timestamp, Actor, BoardSnapshot, Color, FieldError, ForbiddenReason,
    PlaceConfig, PlaceError, Placement, PlacementId, RectAttribution,
};

use crate::broadcast::BroadcastBus;
use crate::cache::{build_board, RebuildReport, SnapshotCache};
use crate::cooldown::CooldownPolicy;
use crate::protocol::BroadcastEvent;
use crate::storage::{DurableLog, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementStage {
    Received,
    Validated,
    EligibilityChecked,
    CooldownChecked,
    Committed,
    Broadcast,
    Acknowledged,
}

impl fmt::Display for PlacementStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::EligibilityChecked => "eligibility-checked",
            Self::CooldownChecked => "cooldown-checked",
            Self::Committed => "committed",
            Self::Broadcast => "broadcast",
            Self::Acknowledged => "acknowledged",
        };
        f.write_str(name)
    }
}

/// Successful single placement.
#[derive(Debug, Clone, PartialEq)]
pub struct Placed {
    pub placement_id: PlacementId,
    /// Cooldown the actor must now observe; zero for privileged actors.
    pub wait_seconds: f64,
}

/// Successful rectangle placement, after clamping to the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RectanglePlaced {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub placement_ids: Vec<PlacementId>,
}

impl RectanglePlaced {
    pub fn cells(&self) -> usize {
        self.placement_ids.len()
    }
}

/// Which read path produced a board snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardSource {
    /// Served from the live cache.
    Cache,
    /// Computed from the durable log.
    Log,
    /// The cache was rebuilt from the log first.
    Rebuild,
}

#[derive(Debug, Clone)]
pub struct BoardRead {
    pub snapshot: Arc<BoardSnapshot>,
    pub source: BoardSource,
}

/// How [`PlacementService::warm_cache`] populated the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    /// Exported snapshot bytes were loaded, then `replayed` newer
    /// placements from the log were applied on top.
    Restored { timestamp: u32, replayed: u64 },
    /// The bytes were unusable and the log was replayed instead.
    Rebuilt(RebuildReport),
}

pub struct PlacementService {
    config: PlaceConfig,
    log: Arc<dyn DurableLog>,
    cache: Arc<SnapshotCache>,
    bus: Arc<BroadcastBus>,
    policy: CooldownPolicy,
}

impl PlacementService {
    pub fn new(
        config: PlaceConfig,
        log: Arc<dyn DurableLog>,
        cache: Arc<SnapshotCache>,
        bus: Arc<BroadcastBus>,
    ) -> Self {
        let policy = CooldownPolicy::from_config(&config);
        Self {
            config,
            log,
            cache,
            bus,
            policy,
        }
    }

    pub fn config(&self) -> &PlaceConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn bus(&self) -> &Arc<BroadcastBus> {
        &self.bus
    }

    // ─── Writes ───────────────────────────────────────────────────────

    /// Place one pixel on behalf of `actor`.
    pub async fn place(
        &self,
        actor: &Actor,
        x: i64,
        y: i64,
        color: i64,
        now: DateTime<Utc>,
    ) -> Result<Placed, PlaceError> {
        self.trace(actor, PlacementStage::Received);

        let mut fields = Vec::new();
        let x = self.check_x(x, &mut fields);
        let y = self.check_y(y, &mut fields);
        let color = self.check_color(color, &mut fields);
        let (Some(x), Some(y), Some(color)) = (x, y, color) else {
            return Err(self.reject(actor, PlaceError::InvalidArgument { fields }));
        };
        self.trace(actor, PlacementStage::Validated);

        self.policy
            .check_eligibility(actor)
            .map_err(|e| self.reject(actor, e))?;
        self.trace(actor, PlacementStage::EligibilityChecked);

        let wait_seconds = self
            .policy
            .wait_seconds(self.log.as_ref(), actor, now)
            .map_err(storage_unavailable)?;
        if self.policy.is_limited(wait_seconds) {
            return Err(self.reject(actor, PlaceError::RateLimited { wait_seconds }));
        }
        self.trace(actor, PlacementStage::CooldownChecked);

        let placement = Placement::new(Some(actor.id.clone()), x, y, color, now);
        let placement_id = self.with_retry(|| self.log.append(&placement)).await?;
        self.trace(actor, PlacementStage::Committed);

        self.update_cache(std::slice::from_ref(&placement)).await;
        self.publish(&BroadcastEvent::place(&placement)).await;
        self.trace(actor, PlacementStage::Broadcast);

        log::debug!("{} placed {color} at ({x}, {y})", actor.id);
        self.trace(actor, PlacementStage::Acknowledged);
        Ok(Placed {
            placement_id,
            wait_seconds: self.policy.after_placement(actor),
        })
    }

    /// Fill a rectangle with one color. Privileged actors only.
    ///
    /// The rectangle is clamped to the board. All cells are appended in one
    /// batch and announced in one `batch-place` event.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_rectangle(
        &self,
        actor: &Actor,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        color: i64,
        now: DateTime<Utc>,
    ) -> Result<RectanglePlaced, PlaceError> {
        if !actor.privileged {
            return Err(PlaceError::forbidden(ForbiddenReason::NotPrivileged));
        }

        let mut fields = Vec::new();
        let x = self.check_x(x, &mut fields);
        let y = self.check_y(y, &mut fields);
        let width = self.check_rect_side("width", width, &mut fields);
        let height = self.check_rect_side("height", height, &mut fields);
        let color = self.check_color(color, &mut fields);
        let (Some(x), Some(y), Some(width), Some(height), Some(color)) =
            (x, y, width, height, color)
        else {
            return Err(PlaceError::InvalidArgument { fields });
        };

        let dims = self.config.dims();
        let width = width.min(dims.width - x);
        let height = height.min(dims.height - y);

        let author = match self.config.rect_attribution {
            RectAttribution::Anonymous => None,
            RectAttribution::Actor => Some(actor.id.clone()),
        };
        let placements: Vec<Placement> = (y..y + height)
            .flat_map(|cy| (x..x + width).map(move |cx| (cx, cy)))
            .map(|(cx, cy)| Placement::new(author.clone(), cx, cy, color, now))
            .collect();

        let placement_ids = self
            .with_retry(|| self.log.append_batch(&placements))
            .await?;

        self.update_cache(&placements).await;
        self.publish(&BroadcastEvent::batch_place(&placements)).await;

        log::info!(
            "{} filled {width}x{height} at ({x}, {y}) with {color}",
            actor.id
        );
        Ok(RectanglePlaced {
            x,
            y,
            width,
            height,
            placement_ids,
        })
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Cache-tier read. Falls back to the log on a miss and repopulates
    /// the cache on the way. Concurrent misses share one rebuild.
    pub async fn get_board(&self) -> Result<BoardRead, PlaceError> {
        if let Some(snapshot) = self.cache.get_snapshot().await {
            return Ok(BoardRead {
                snapshot,
                source: BoardSource::Cache,
            });
        }

        log::debug!("board cache miss, reading from the log");
        self.cache
            .rebuild_if_empty(self.log.as_ref())
            .await
            .map_err(storage_unavailable)?;

        match self.cache.get_full_snapshot(Utc::now()).await {
            Some(snapshot) => Ok(BoardRead {
                snapshot,
                source: BoardSource::Log,
            }),
            None => self.get_board_uncached(Utc::now()),
        }
    }

    /// Direct read: compute the board from the log without touching the
    /// cache.
    pub fn get_board_uncached(&self, now: DateTime<Utc>) -> Result<BoardRead, PlaceError> {
        let (grid, _) = build_board(self.log.as_ref(), self.config.dims())
            .map_err(storage_unavailable)?;
        let snapshot = encode(&grid, snapshot_timestamp(now))
            .map_err(|e| PlaceError::StorageUnavailable(e.to_string()))?;
        Ok(BoardRead {
            snapshot: Arc::new(snapshot),
            source: BoardSource::Log,
        })
    }

    /// Rebuild the cache from the log, then serve from it.
    pub async fn get_board_rebuilt(&self, now: DateTime<Utc>) -> Result<BoardRead, PlaceError> {
        self.rebuild_cache().await?;
        match self.cache.get_full_snapshot(now).await {
            Some(snapshot) => Ok(BoardRead {
                snapshot,
                source: BoardSource::Rebuild,
            }),
            None => self.get_board_uncached(now),
        }
    }

    /// Current placement at a cell for ordinary callers: administrative
    /// blanks read as unset.
    pub fn get_pixel(&self, x: i64, y: i64) -> Result<Option<Placement>, PlaceError> {
        Ok(self.inspect_pixel(x, y)?.filter(|p| !p.is_anonymous()))
    }

    /// Current placement at a cell, including anonymous ones.
    pub fn inspect_pixel(&self, x: i64, y: i64) -> Result<Option<Placement>, PlaceError> {
        let mut fields = Vec::new();
        let x = self.check_x(x, &mut fields);
        let y = self.check_y(y, &mut fields);
        let (Some(x), Some(y)) = (x, y) else {
            return Err(PlaceError::InvalidArgument { fields });
        };
        self.log
            .get_current_placement(x, y)
            .map_err(storage_unavailable)
    }

    /// Seconds `actor` must wait before placing, after the eligibility gate.
    pub fn wait_seconds_for(&self, actor: &Actor, now: DateTime<Utc>) -> Result<f64, PlaceError> {
        self.policy.check_eligibility(actor)?;
        self.policy
            .wait_seconds(self.log.as_ref(), actor, now)
            .map_err(storage_unavailable)
    }

    // ─── Recovery ─────────────────────────────────────────────────────

    /// Re-derive the cache from the log. Safe to run at any time.
    pub async fn rebuild_cache(&self) -> Result<RebuildReport, PlaceError> {
        self.cache
            .rebuild_from(self.log.as_ref())
            .await
            .map_err(storage_unavailable)
    }

    /// Populate the cache from exported snapshot bytes, then apply every
    /// placement made since the export was taken. Bytes that do not fit
    /// the board fall back to a full replay of the log.
    pub async fn warm_cache(&self, bytes: &[u8]) -> Result<WarmOutcome, PlaceError> {
        match self.cache.warm_from_bytes(bytes).await {
            Ok(timestamp) => {
                log::info!("cache warmed from snapshot taken at {timestamp}");
                let report = self
                    .cache
                    .catch_up(self.log.as_ref(), timestamp)
                    .await
                    .map_err(storage_unavailable)?;
                Ok(WarmOutcome::Restored {
                    timestamp,
                    replayed: report.scanned,
                })
            }
            Err(e) => self
                .recover_cache(PlaceError::CacheInconsistent(e.to_string()))
                .await
                .map(WarmOutcome::Rebuilt),
        }
    }

    async fn recover_cache(&self, cause: PlaceError) -> Result<RebuildReport, PlaceError> {
        log::warn!("{cause}; rebuilding from the log");
        self.cache.invalidate().await;
        self.rebuild_cache().await
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn check_x(&self, x: i64, fields: &mut Vec<FieldError>) -> Option<u32> {
        if self.config.dims().contains_x(x) {
            Some(x as u32)
        } else {
            fields.push(FieldError::bad_number("x"));
            None
        }
    }

    fn check_y(&self, y: i64, fields: &mut Vec<FieldError>) -> Option<u32> {
        if self.config.dims().contains_y(y) {
            Some(y as u32)
        } else {
            fields.push(FieldError::bad_number("y"));
            None
        }
    }

    fn check_color(&self, color: i64, fields: &mut Vec<FieldError>) -> Option<Color> {
        if (0..=i64::from(self.config.max_color())).contains(&color) {
            Some(color as Color)
        } else {
            fields.push(FieldError::bad_color("color"));
            None
        }
    }

    fn check_rect_side(
        &self,
        field: &'static str,
        value: i64,
        fields: &mut Vec<FieldError>,
    ) -> Option<u32> {
        if (1..=i64::from(self.config.admin_rect_max_size)).contains(&value) {
            Some(value as u32)
        } else {
            fields.push(FieldError::bad_number(field));
            None
        }
    }

    /// Run a durable write, retrying with linear backoff. Exhausting the
    /// budget yields `StorageUnavailable`.
    async fn with_retry<T>(
        &self,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, PlaceError> {
        let attempts = self.config.write_retries + 1;
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    log::warn!("durable write failed (attempt {attempt}/{attempts}): {e}");
                    tokio::time::sleep(self.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("durable write failed after {attempts} attempts: {e}");
                    return Err(storage_unavailable(e));
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff * attempt
    }

    async fn update_cache(&self, placements: &[Placement]) {
        for p in placements {
            match self.cache.set_pixel(p.x, p.y, p.color).await {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("cache not populated, ({}, {}) left to the next rebuild", p.x, p.y);
                    return;
                }
                Err(e) => log::warn!("cache update failed for placement {}: {e}", p.id),
            }
        }
    }

    async fn publish(&self, event: &BroadcastEvent) {
        if let Err(e) = self.bus.publish(&self.config.namespace, event).await {
            log::warn!("failed to broadcast {} event: {e}", event.event_type());
        }
    }

    fn trace(&self, actor: &Actor, stage: PlacementStage) {
        log::trace!("placement by {}: {stage}", actor.id);
    }

    fn reject(&self, actor: &Actor, reason: PlaceError) -> PlaceError {
        log::debug!("placement by {} rejected: {reason}", actor.id);
        reason
    }
}

fn storage_unavailable(e: StoreError) -> PlaceError {
    PlaceError::StorageUnavailable(e.to_string())
}
