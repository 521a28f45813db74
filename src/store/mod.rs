//! Transactional store over the persistent entities.
//!
//! The backing relational engine is deliberately out of scope; what this
//! module preserves is the logical contract: explicit transactions, locked
//! reads for anything that will be updated, `ENOENT`/`EEXIST` mapping, and
//! rollback on every non-commit exit path. All tables sit behind one mutex
//! that a [`Transaction`] holds for its whole lifetime, so concurrent
//! handlers fully serialize and a get-then-update sequence can never
//! interleave with another handler's writes.

mod tx;

pub use tx::Transaction;

use crate::error::StoreError;
use crate::types::{
    DensityMapping, DeviceGroupMapping, DeviceGroupWeight, Tag, TapeLibrary, TapeModel, TapePool,
    TapeSide, TapeVolume,
};
use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

/// Every table of the inventory. Cloned wholesale at transaction begin to
/// serve as the undo image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub volumes: BTreeMap<String, TapeVolume>,
    pub sides: Vec<TapeSide>,
    pub pools: BTreeMap<String, TapePool>,
    pub libraries: BTreeMap<String, TapeLibrary>,
    pub models: BTreeMap<String, TapeModel>,
    pub denmaps: Vec<DensityMapping>,
    pub dgnmaps: Vec<DeviceGroupMapping>,
    pub weights: BTreeMap<String, DeviceGroupWeight>,
    pub tags: BTreeMap<String, Tag>,
}

/// Owner of the inventory tables and of the optional JSON snapshot they are
/// rehydrated from at boot.
pub struct VolumeStore {
    tables: Mutex<Tables>,
    snapshot: Option<PathBuf>,
}

impl VolumeStore {
    /// Fresh in-memory store with no persistence.
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Store backed by a JSON snapshot, loaded now if the file exists and
    /// rewritten on every committed transaction.
    pub fn open(snapshot: PathBuf) -> Result<Self, StoreError> {
        let tables = if snapshot.exists() {
            let raw = std::fs::read_to_string(&snapshot)?;
            let tables: Tables = serde_json::from_str(&raw)?;
            info!(
                "event=store_loaded path={} volumes={} pools={}",
                snapshot.display(),
                tables.volumes.len(),
                tables.pools.len()
            );
            tables
        } else {
            Tables::default()
        };
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(snapshot),
        })
    }

    /// Opens a transaction, blocking until the store lock is available.
    /// Dropping the returned guard without calling `commit` rolls every
    /// change back.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self.tables.lock(), self.snapshot.as_deref())
    }
}

/// Atomically replaces the snapshot file: write to a sibling temp file,
/// fsync, rename over the target.
pub(crate) fn persist_snapshot(
    path: &std::path::Path,
    tables: &Tables,
) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = std::fs::File::create(&tmp)?;
    let raw = serde_json::to_vec_pretty(tables)?;
    file.write_all(&raw)?;
    file.sync_all()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
