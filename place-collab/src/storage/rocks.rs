//! RocksDB-backed placement log.
//!
//! Column families:
//! - `placements` — every placement ever made, keyed by its time-ordered id
//! - `pixels`     — `(x, y)` → `(created_at, id)` of the winning placement
//! - `actors`     — actor id → time of that actor's latest placement
//!
//! The two views are maintained with merge operators that keep the
//! maximum, so concurrent or out-of-order appends converge on the same
//! answer as a full last-write-wins scan. A placement and both of its
//! view updates go into one `WriteBatch`.

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MergeOperands, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};

use place_core::{ActorId, Placement, PlacementId};

use super::{coord_key, decode_placement, encode_placement, DurableLog, PlacementScan, StoreError};

const CF_PLACEMENTS: &str = "placements";
const CF_PIXELS: &str = "pixels";
const CF_ACTORS: &str = "actors";

const COLUMN_FAMILIES: &[&str] = &[CF_PLACEMENTS, CF_PIXELS, CF_ACTORS];

/// `created_at` micros (8, big-endian) followed by the placement id (16).
const PIXEL_VALUE_LEN: usize = 24;
const ACTOR_VALUE_LEN: usize = 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every write batch before acknowledging it (default: true)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("place_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed durable placement log.
pub struct RocksLog {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksLog {
    /// Open the log at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Self::db_options(&config);
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            Self::cf_descriptors(&config),
        )?;

        log::info!("opened placement log at {}", config.path.display());
        Ok(Self { db, config })
    }

    /// Open an existing log without taking the writer lock, so a live
    /// server can keep running while the log is scanned. Writes fail.
    pub fn open_read_only(config: StoreConfig) -> Result<Self, StoreError> {
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors_read_only(
            &Self::db_options(&config),
            &config.path,
            Self::cf_descriptors(&config),
            false,
        )?;

        log::info!("opened placement log at {} (read-only)", config.path.display());
        Ok(Self { db, config })
    }

    fn db_options(config: &StoreConfig) -> Options {
        let mut db_opts = Options::default();
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());
        db_opts
    }

    fn cf_descriptors(config: &StoreConfig) -> Vec<ColumnFamilyDescriptor> {
        COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, config)))
            .collect()
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_PLACEMENTS => {
                // Append-mostly, read back only by point lookup and full scan.
                opts.set_max_write_buffer_number(4);
            }
            CF_PIXELS => {
                opts.set_merge_operator_associative("latest_placement", merge_latest_pixel);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ACTORS => {
                opts.set_merge_operator_associative("latest_time", merge_latest_time);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn stage(&self, batch: &mut WriteBatch, placement: &Placement) -> Result<(), StoreError> {
        let cf_placements = self.cf(CF_PLACEMENTS)?;
        let cf_pixels = self.cf(CF_PIXELS)?;
        let cf_actors = self.cf(CF_ACTORS)?;

        batch.put_cf(cf_placements, placement.id.as_bytes(), encode_placement(placement)?);
        batch.merge_cf(
            cf_pixels,
            coord_key(placement.x, placement.y),
            pixel_value(placement.created_at, placement.id),
        );
        if let Some(actor) = &placement.actor {
            batch.merge_cf(
                cf_actors,
                actor.as_bytes(),
                placement.created_at.timestamp_micros().to_be_bytes(),
            );
        }
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl DurableLog for RocksLog {
    fn append(&self, placement: &Placement) -> Result<PlacementId, StoreError> {
        let mut batch = WriteBatch::default();
        self.stage(&mut batch, placement)?;
        self.commit(batch)?;
        Ok(placement.id)
    }

    fn append_batch(&self, placements: &[Placement]) -> Result<Vec<PlacementId>, StoreError> {
        let mut batch = WriteBatch::default();
        for placement in placements {
            self.stage(&mut batch, placement)?;
        }
        self.commit(batch)?;
        Ok(placements.iter().map(|p| p.id).collect())
    }

    fn get_current_placement(&self, x: u32, y: u32) -> Result<Option<Placement>, StoreError> {
        let cf_pixels = self.cf(CF_PIXELS)?;
        let Some(value) = self.db.get_cf(cf_pixels, coord_key(x, y))? else {
            return Ok(None);
        };
        let (_, id) = parse_pixel_value(&value).ok_or_else(|| {
            StoreError::DeserializationError(format!("bad pixel index entry at ({x}, {y})"))
        })?;

        let cf_placements = self.cf(CF_PLACEMENTS)?;
        match self.db.get_cf(cf_placements, id.as_bytes())? {
            Some(bytes) => decode_placement(&bytes).map(Some),
            None => Err(StoreError::DatabaseError(format!(
                "pixel ({x}, {y}) points at missing placement {id}"
            ))),
        }
    }

    fn get_last_placement_time(
        &self,
        actor: &ActorId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let cf = self.cf(CF_ACTORS)?;
        let Some(value) = self.db.get_cf(cf, actor.as_bytes())? else {
            return Ok(None);
        };
        let micros = parse_micros(&value).ok_or_else(|| {
            StoreError::DeserializationError(format!("bad actor index entry for {actor}"))
        })?;
        DateTime::from_timestamp_micros(micros).map(Some).ok_or_else(|| {
            StoreError::DeserializationError(format!("timestamp out of range for {actor}"))
        })
    }

    fn scan_all(&self) -> PlacementScan<'_> {
        let cf = match self.cf(CF_PLACEMENTS) {
            Ok(cf) => cf,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        Box::new(
            self.db
                .iterator_cf(cf, IteratorMode::Start)
                .map(|item| {
                    let (_, value) = item?;
                    decode_placement(&value).map(|p| p.record())
                }),
        )
    }

    fn placement_count(&self) -> Result<u64, StoreError> {
        let cf = self.cf(CF_PLACEMENTS)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

fn pixel_value(created_at: DateTime<Utc>, id: PlacementId) -> [u8; PIXEL_VALUE_LEN] {
    let mut value = [0u8; PIXEL_VALUE_LEN];
    value[..8].copy_from_slice(&created_at.timestamp_micros().to_be_bytes());
    value[8..].copy_from_slice(id.as_bytes());
    value
}

fn parse_pixel_value(value: &[u8]) -> Option<(i64, PlacementId)> {
    if value.len() != PIXEL_VALUE_LEN {
        return None;
    }
    let micros = parse_micros(&value[..8])?;
    let id: [u8; 16] = value[8..].try_into().ok()?;
    Some((micros, PlacementId::from_bytes(id)))
}

fn parse_micros(value: &[u8]) -> Option<i64> {
    let bytes: [u8; ACTOR_VALUE_LEN] = value.try_into().ok()?;
    Some(i64::from_be_bytes(bytes))
}

/// Keep whichever operand names the later `(created_at, id)`.
fn merge_latest_pixel(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut best = existing.and_then(|v| parse_pixel_value(v).map(|order| (order, v)));
    for operand in operands.iter() {
        let Some(order) = parse_pixel_value(operand) else {
            continue;
        };
        if best.as_ref().is_none_or(|(current, _)| order > *current) {
            best = Some((order, operand));
        }
    }
    best.map(|(_, value)| value.to_vec())
}

/// Keep the maximum timestamp.
fn merge_latest_time(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    existing
        .and_then(parse_micros)
        .into_iter()
        .chain(operands.iter().filter_map(parse_micros))
        .max()
        .map(|micros| micros.to_be_bytes().to_vec())
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
