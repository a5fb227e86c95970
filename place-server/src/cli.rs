//! Command-line and environment configuration for the binaries.
//!
//! Every flag has a `PLACE_*` environment fallback so the same binary can
//! be configured from a process manager without a wrapper script.

use chrono::{DateTime, Utc};
use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use place_collab::{ServerConfig, StoreConfig};
use place_core::{ConfigError, PlaceConfig, RectAttribution};

/// Canvas shape and placement rules.
#[derive(Debug, Clone, Args)]
pub struct CanvasArgs {
    #[arg(long, env = "PLACE_BOARD_WIDTH", default_value_t = 1000)]
    pub board_width: u32,

    #[arg(long, env = "PLACE_BOARD_HEIGHT", default_value_t = 1000)]
    pub board_height: u32,

    #[arg(long, env = "PLACE_COLOR_BIT_DEPTH", default_value_t = 4)]
    pub color_bit_depth: u8,

    /// Seconds between placements by one actor
    #[arg(long, env = "PLACE_COOLDOWN_SECS", default_value_t = 120)]
    pub cooldown_secs: u64,

    /// Waits at or below this many seconds are forgiven
    #[arg(long, env = "PLACE_COOLDOWN_GRACE_SECS", default_value_t = 2)]
    pub cooldown_grace_secs: u64,

    #[arg(long, env = "PLACE_ADMIN_RECT_MAX_SIZE", default_value_t = 100)]
    pub admin_rect_max_size: u32,

    /// Accounts created at or after this instant (RFC 3339) may not place
    #[arg(
        long,
        env = "PLACE_ACCOUNT_AGE_CUTOFF",
        default_value = "2017-04-01T00:00:00Z",
        value_parser = parse_instant
    )]
    pub account_age_cutoff: DateTime<Utc>,

    #[arg(long, env = "PLACE_SNAPSHOT_MAX_AGE_MS", default_value_t = 1000)]
    pub snapshot_max_age_ms: u64,

    /// Extra attempts for a failed durable append
    #[arg(long, env = "PLACE_WRITE_RETRIES", default_value_t = 2)]
    pub write_retries: u32,

    #[arg(long, env = "PLACE_RETRY_BACKOFF_MS", default_value_t = 50)]
    pub retry_backoff_ms: u64,

    /// `anonymous` or `actor`
    #[arg(long, env = "PLACE_RECT_ATTRIBUTION", default_value = "anonymous")]
    pub rect_attribution: RectAttribution,

    #[arg(long, env = "PLACE_NAMESPACE", default_value = "/place")]
    pub namespace: String,
}

impl CanvasArgs {
    pub fn to_config(&self) -> Result<PlaceConfig, ConfigError> {
        let config = PlaceConfig {
            board_width: self.board_width,
            board_height: self.board_height,
            color_bit_depth: self.color_bit_depth,
            cooldown_duration: Duration::from_secs(self.cooldown_secs),
            cooldown_grace: Duration::from_secs(self.cooldown_grace_secs),
            admin_rect_max_size: self.admin_rect_max_size,
            account_age_cutoff: self.account_age_cutoff,
            snapshot_max_age: Duration::from_millis(self.snapshot_max_age_ms),
            write_retries: self.write_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            rect_attribution: self.rect_attribution,
            namespace: self.namespace.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// RocksDB location and tuning.
#[derive(Debug, Clone, Args)]
pub struct StoreArgs {
    #[arg(long, env = "PLACE_DATA_DIR", default_value = "place_data")]
    pub data_dir: PathBuf,

    /// Acknowledge writes before they are fsynced
    #[arg(long, env = "PLACE_NO_SYNC")]
    pub no_sync: bool,

    #[arg(long, env = "PLACE_BLOCK_CACHE_MB", default_value_t = 128)]
    pub block_cache_mb: usize,
}

impl StoreArgs {
    pub fn to_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.data_dir.clone(),
            block_cache_size: self.block_cache_mb * 1024 * 1024,
            sync_writes: !self.no_sync,
            ..StoreConfig::default()
        }
    }
}

/// `placed`: serve the canvas to WebSocket viewers.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct ServeCli {
    #[command(flatten)]
    pub canvas: CanvasArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, env = "PLACE_BIND", default_value = "127.0.0.1:9090")]
    pub bind: String,

    #[arg(long, env = "PLACE_BROADCAST_CAPACITY", default_value_t = 256)]
    pub broadcast_capacity: usize,

    /// Seconds between viewer-count events, 0 to disable
    #[arg(long, env = "PLACE_ACTIVITY_INTERVAL_SECS", default_value_t = 10)]
    pub activity_interval_secs: u64,

    /// Keep placements in memory only
    #[arg(long)]
    pub in_memory: bool,

    /// Warm the board cache from an exported snapshot instead of
    /// replaying the log
    #[arg(long, env = "PLACE_WARM_FROM")]
    pub warm_from: Option<PathBuf>,
}

impl ServeCli {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind.clone(),
            broadcast_capacity: self.broadcast_capacity,
            activity_interval_secs: self.activity_interval_secs,
        }
    }
}

/// `place-rebuild`: replay the placement log into a board.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct RebuildCli {
    #[command(flatten)]
    pub canvas: CanvasArgs,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Write the rebuilt snapshot bytes to this file
    #[arg(long)]
    pub export: Option<PathBuf>,
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}
