//! Persistence integration tests.
//!
//! Verifies:
//! - Placements survive a restart and the board is rebuilt from the log
//! - Last write wins per cell regardless of append order
//! - Cooldowns are enforced across restarts
//! - Admin rectangles clamp at the board edge on a full-size board
//! - Exported snapshots warm a fresh cache and catch up with the log

use chrono::{DateTime, TimeZone, Utc};
use place_collab::cache::build_board;
use place_collab::service::{BoardSource, WarmOutcome};
use place_collab::storage::{DurableLog, RocksLog, StoreConfig};
use place_collab::{BroadcastBus, PlacementService, SnapshotCache};
use place_core::{Actor, ActorId, PlaceConfig, PlaceError, Placement};
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_490_000_000 + secs, 0).unwrap()
}

fn actor(id: &str) -> Actor {
    Actor::new(id, Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap())
}

fn open_log(path: &Path) -> Arc<RocksLog> {
    Arc::new(RocksLog::open(StoreConfig::for_testing(path)).unwrap())
}

fn service_over(config: PlaceConfig, log: Arc<RocksLog>) -> PlacementService {
    let cache = Arc::new(SnapshotCache::new(config.dims(), config.snapshot_max_age));
    PlacementService::new(config, log, cache, Arc::new(BroadcastBus::new(16)))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_board_survives_restart() {
    let dir = tempdir().unwrap();

    {
        let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
        service.place(&actor("a"), 1, 2, 3, at(0)).await.unwrap();
        service.place(&actor("b"), 15, 15, 9, at(1)).await.unwrap();
        service.place(&actor("c"), 1, 2, 4, at(2)).await.unwrap();
    }

    let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
    assert!(!service.cache().is_populated().await);

    let read = service.get_board().await.unwrap();
    assert_eq!(read.source, BoardSource::Log);
    assert!(service.cache().is_populated().await);

    assert_eq!(service.cache().get_pixel(1, 2).await, Some(4));
    assert_eq!(service.cache().get_pixel(15, 15).await, Some(9));
    assert_eq!(service.log().placement_count().unwrap(), 3);

    let current = service.get_pixel(1, 2).unwrap().unwrap();
    assert_eq!(current.actor, Some(ActorId::new("c")));
}

#[tokio::test]
async fn test_last_write_wins_regardless_of_append_order() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path());
    let newer = Placement::new(Some(ActorId::new("late")), 4, 4, 2, at(5));
    let older = Placement::new(Some(ActorId::new("early")), 4, 4, 1, at(3));

    log.append(&newer).unwrap();
    log.append(&older).unwrap();

    let current = log.get_current_placement(4, 4).unwrap().unwrap();
    assert_eq!(current.color, 2);

    let config = PlaceConfig::for_testing();
    let (grid, report) = build_board(log.as_ref(), config.dims()).unwrap();
    assert_eq!(grid.get(4, 4), Some(2));
    assert_eq!(report.scanned, 2);
}

#[tokio::test]
async fn test_cooldown_enforced_across_restart() {
    let dir = tempdir().unwrap();

    {
        let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
        service.place(&actor("a"), 0, 0, 1, at(0)).await.unwrap();
    }

    let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
    match service.place(&actor("a"), 1, 1, 1, at(3)).await {
        Err(PlaceError::RateLimited { wait_seconds }) => assert_eq!(wait_seconds, 7.0),
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert!(service.place(&actor("a"), 1, 1, 1, at(10)).await.is_ok());
}

#[tokio::test]
async fn test_rectangle_clamps_on_full_board() {
    let dir = tempdir().unwrap();
    let service = service_over(PlaceConfig::default(), open_log(dir.path()));
    let admin = actor("admin").privileged();

    let rect = service
        .place_rectangle(&admin, 995, 995, 20, 20, 0, at(0))
        .await
        .unwrap();
    assert_eq!((rect.width, rect.height), (5, 5));
    assert_eq!(rect.cells(), 25);
    assert_eq!(service.log().placement_count().unwrap(), 25);

    let corner = service.inspect_pixel(999, 999).unwrap().unwrap();
    assert!(corner.is_anonymous());
    assert!(service.inspect_pixel(994, 999).unwrap().is_none());
}

#[tokio::test]
async fn test_exported_snapshot_warms_fresh_cache() {
    let dir = tempdir().unwrap();
    let exported = {
        let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
        service.place(&actor("a"), 7, 7, 12, at(0)).await.unwrap();
        service.get_board_uncached(at(1)).unwrap().snapshot
    };

    let other = tempdir().unwrap();
    let service = service_over(PlaceConfig::for_testing(), open_log(other.path()));
    let outcome = service.warm_cache(exported.as_bytes()).await.unwrap();
    assert_eq!(
        outcome,
        WarmOutcome::Restored {
            timestamp: exported.timestamp(),
            replayed: 0
        }
    );
    assert_eq!(service.cache().get_pixel(7, 7).await, Some(12));

    let read = service.get_board().await.unwrap();
    assert_eq!(read.source, BoardSource::Cache);
    assert_eq!(read.snapshot.bitmap(), exported.bitmap());
}

#[tokio::test]
async fn test_truncated_snapshot_falls_back_to_log() {
    let dir = tempdir().unwrap();
    let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
    service.place(&actor("a"), 2, 2, 5, at(0)).await.unwrap();
    service.cache().invalidate().await;

    match service.warm_cache(&[0, 0, 0, 0, 1, 2]).await.unwrap() {
        WarmOutcome::Rebuilt(report) => assert_eq!(report.cells_set, 1),
        other => panic!("expected rebuild, got {other:?}"),
    }
    assert_eq!(service.cache().get_pixel(2, 2).await, Some(5));
}

#[tokio::test]
async fn test_warm_start_applies_placements_newer_than_export() {
    let dir = tempdir().unwrap();
    let exported = {
        let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
        service.place(&actor("a"), 1, 1, 2, at(0)).await.unwrap();
        let exported = service.get_board_uncached(at(1)).unwrap().snapshot;
        service.place(&actor("b"), 3, 3, 9, at(5)).await.unwrap();
        exported
    };

    let service = service_over(PlaceConfig::for_testing(), open_log(dir.path()));
    match service.warm_cache(exported.as_bytes()).await.unwrap() {
        WarmOutcome::Restored { replayed, .. } => assert_eq!(replayed, 1),
        other => panic!("expected restore, got {other:?}"),
    }

    let read = service.get_board().await.unwrap();
    assert_eq!(read.source, BoardSource::Cache);
    let (_, grid) = place_core::decode(PlaceConfig::for_testing().dims(), read.snapshot.as_bytes()).unwrap();
    assert_eq!(grid.get(3, 3), Some(9));
    assert_eq!(grid.get(1, 1), Some(2));
}
