//! In-process placement log for tests, benches and `--in-memory` runs.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use place_core::{ActorId, Placement, PlacementId};

use super::{DurableLog, PlacementScan, StoreError};

#[derive(Default)]
struct Inner {
    placements: Vec<Placement>,
    /// Index into `placements` of the winning placement per cell.
    pixels: HashMap<(u32, u32), usize>,
    actors: HashMap<ActorId, DateTime<Utc>>,
}

impl Inner {
    fn insert(&mut self, placement: &Placement) {
        let index = self.placements.len();
        self.placements.push(placement.clone());

        let key = (placement.x, placement.y);
        let wins = self
            .pixels
            .get(&key)
            .is_none_or(|&current| placement.supersedes(&self.placements[current]));
        if wins {
            self.pixels.insert(key, index);
        }

        if let Some(actor) = &placement.actor {
            let last = self.actors.entry(actor.clone()).or_insert(placement.created_at);
            if placement.created_at > *last {
                *last = placement.created_at;
            }
        }
    }
}

/// Same semantics as [`super::RocksLog`], held in memory.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<Inner>,
    failures: AtomicU32,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a database error.
    pub fn fail_next_writes(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::DatabaseError("injected write failure".into()));
        }
        Ok(())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::DatabaseError("memory log lock poisoned".into()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::DatabaseError("memory log lock poisoned".into()))
    }
}

impl DurableLog for MemoryLog {
    fn append(&self, placement: &Placement) -> Result<PlacementId, StoreError> {
        self.take_failure()?;
        self.write()?.insert(placement);
        Ok(placement.id)
    }

    fn append_batch(&self, placements: &[Placement]) -> Result<Vec<PlacementId>, StoreError> {
        self.take_failure()?;
        let mut inner = self.write()?;
        for placement in placements {
            inner.insert(placement);
        }
        Ok(placements.iter().map(|p| p.id).collect())
    }

    fn get_current_placement(&self, x: u32, y: u32) -> Result<Option<Placement>, StoreError> {
        let inner = self.read()?;
        Ok(inner
            .pixels
            .get(&(x, y))
            .map(|&index| inner.placements[index].clone()))
    }

    fn get_last_placement_time(
        &self,
        actor: &ActorId,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.read()?.actors.get(actor).copied())
    }

    fn scan_all(&self) -> PlacementScan<'_> {
        // Copied out under the read lock.
        match self.read() {
            Ok(inner) => {
                let records: Vec<_> = inner.placements.iter().map(Placement::record).collect();
                Box::new(records.into_iter().map(Ok))
            }
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn placement_count(&self) -> Result<u64, StoreError> {
        Ok(self.read()?.placements.len() as u64)
    }
}
