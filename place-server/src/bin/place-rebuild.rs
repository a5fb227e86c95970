//! `place-rebuild`: replay the placement log and report what it holds.
//!
//! Opens the log read-only, so it can run next to a live `placed`.

use chrono::Utc;
use clap::Parser;

use place_collab::build_board;
use place_collab::storage::{DurableLog, RocksLog};
use place_core::{encode, snapshot_timestamp};
use place_server::cli::RebuildCli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = RebuildCli::parse();

    let config = cli.canvas.to_config()?;
    let log = RocksLog::open_read_only(cli.store.to_config())?;

    let (grid, report) = build_board(&log, config.dims())?;
    println!("placements in log:      {}", log.placement_count()?);
    println!("placements scanned:     {}", report.scanned);
    println!("cells set:              {}", report.cells_set);
    println!("skipped (out of board): {}", report.skipped_out_of_bounds);
    println!("skipped (bad color):    {}", report.skipped_bad_color);

    if let Some(path) = &cli.export {
        let snapshot = encode(&grid, snapshot_timestamp(Utc::now()))?;
        std::fs::write(path, snapshot.as_bytes())?;
        println!("snapshot written to {} ({} bytes)", path.display(), snapshot.len());
    }
    Ok(())
}
