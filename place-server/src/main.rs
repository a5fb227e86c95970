//! `placed`: the canvas viewer server.

use clap::Parser;
use std::sync::Arc;

use place_collab::{
    BroadcastBus, DurableLog, MemoryLog, PlacementService, RocksLog, SnapshotCache,
    ViewerServer, WarmOutcome,
};
use place_server::cli::ServeCli;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = ServeCli::parse();

    let config = cli.canvas.to_config()?;
    let server_config = cli.server_config();

    let log: Arc<dyn DurableLog> = if cli.in_memory {
        log::warn!("running with an in-memory log; placements are lost on exit");
        Arc::new(MemoryLog::new())
    } else {
        Arc::new(RocksLog::open(cli.store.to_config())?)
    };
    let cache = Arc::new(SnapshotCache::new(config.dims(), config.snapshot_max_age));
    let bus = Arc::new(BroadcastBus::new(server_config.broadcast_capacity));
    let service = Arc::new(PlacementService::new(config, log, cache, bus));

    match &cli.warm_from {
        Some(path) => {
            let bytes = std::fs::read(path)?;
            match service.warm_cache(&bytes).await? {
                WarmOutcome::Restored {
                    timestamp,
                    replayed,
                } => log::info!(
                    "board restored from {} (taken at {timestamp}), {replayed} newer placements applied",
                    path.display()
                ),
                WarmOutcome::Rebuilt(report) => {
                    log::warn!("{} was unusable, rebuilt instead: {report:?}", path.display())
                }
            }
        }
        None => {
            let report = service.rebuild_cache().await?;
            log::info!(
                "board rebuilt from {} placements ({} cells set)",
                report.scanned,
                report.cells_set
            );
        }
    }

    ViewerServer::new(server_config, service).run().await
}
