//! Entity accessors on an open transaction.
//!
//! Every getter that will be followed by an update executes under the
//! transaction's table lock, so a get-then-update sequence is atomic with
//! respect to every other handler. Inserts enforce key uniqueness
//! (`EEXIST`), lookups report missing rows (`ENOENT`); both carry the
//! entity kind and key for the server log.

use super::{persist_snapshot, Tables};
use crate::error::StoreError;
use crate::types::{
    DensityMapping, DeviceGroupMapping, DeviceGroupWeight, Tag, TapeLibrary, TapeModel, TapePool,
    TapeSide, TapeVolume,
};
use parking_lot::MutexGuard;
use std::path::Path;

pub struct Transaction<'a> {
    tables: MutexGuard<'a, Tables>,
    undo: Tables,
    snapshot: Option<&'a Path>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub(super) fn new(tables: MutexGuard<'a, Tables>, snapshot: Option<&'a Path>) -> Self {
        let undo = tables.clone();
        Self {
            tables,
            undo,
            snapshot,
            committed: false,
        }
    }

    /// Persists the current state and disarms the rollback. Consumes the
    /// transaction, releasing the store lock.
    pub fn commit(mut self) -> Result<(), StoreError> {
        if let Some(path) = self.snapshot {
            persist_snapshot(path, &self.tables)?;
        }
        self.committed = true;
        Ok(())
    }

    // --- volumes ---

    pub fn get_tape(&self, vid: &str) -> Result<TapeVolume, StoreError> {
        self.tables
            .volumes
            .get(vid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tape", vid))
    }

    pub fn insert_tape(&mut self, tape: TapeVolume) -> Result<(), StoreError> {
        if self.tables.volumes.contains_key(&tape.vid) {
            return Err(StoreError::exists("tape", &tape.vid));
        }
        self.tables.volumes.insert(tape.vid.clone(), tape);
        Ok(())
    }

    pub fn update_tape(&mut self, tape: &TapeVolume) -> Result<(), StoreError> {
        match self.tables.volumes.get_mut(&tape.vid) {
            Some(row) => {
                *row = tape.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("tape", &tape.vid)),
        }
    }

    pub fn delete_tape(&mut self, vid: &str) -> Result<(), StoreError> {
        self.tables
            .volumes
            .remove(vid)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("tape", vid))
    }

    pub fn list_tapes(&self) -> Vec<TapeVolume> {
        self.tables.volumes.values().cloned().collect()
    }

    // --- sides ---

    pub fn get_side(&self, vid: &str, side: u16) -> Result<TapeSide, StoreError> {
        self.tables
            .sides
            .iter()
            .find(|s| s.vid == vid && s.side == side)
            .cloned()
            .ok_or_else(|| StoreError::not_found("side", format!("{vid}/{side}")))
    }

    pub fn insert_side(&mut self, side: TapeSide) -> Result<(), StoreError> {
        if self
            .tables
            .sides
            .iter()
            .any(|s| s.vid == side.vid && s.side == side.side)
        {
            return Err(StoreError::exists(
                "side",
                format!("{}/{}", side.vid, side.side),
            ));
        }
        self.tables.sides.push(side);
        Ok(())
    }

    pub fn update_side(&mut self, side: &TapeSide) -> Result<(), StoreError> {
        match self
            .tables
            .sides
            .iter_mut()
            .find(|s| s.vid == side.vid && s.side == side.side)
        {
            Some(row) => {
                *row = side.clone();
                Ok(())
            }
            None => Err(StoreError::not_found(
                "side",
                format!("{}/{}", side.vid, side.side),
            )),
        }
    }

    pub fn delete_side(&mut self, vid: &str, side: u16) -> Result<(), StoreError> {
        let before = self.tables.sides.len();
        self.tables.sides.retain(|s| !(s.vid == vid && s.side == side));
        if self.tables.sides.len() == before {
            return Err(StoreError::not_found("side", format!("{vid}/{side}")));
        }
        Ok(())
    }

    /// Two-phase selection of a side for a write of `size` bytes into
    /// `pool`. Phase one: free sides with enough estimated space, best fit
    /// among the device groups with the lowest weight. Phase two falls back
    /// to the free side with the most space regardless of `size`; only a
    /// pool with no free side at all is a miss.
    pub fn side_for_write(&self, pool: &str, size: u64) -> Result<TapeSide, StoreError> {
        let free_sides: Vec<&TapeSide> = self
            .tables
            .sides
            .iter()
            .filter(|s| s.poolname == pool && s.is_free())
            .collect();

        let fitting = free_sides
            .iter()
            .filter(|s| s.estimated_free_space >= size)
            .min_by_key(|s| (self.weight_for_side(s), s.estimated_free_space));
        if let Some(side) = fitting {
            return Ok((*side).clone());
        }

        free_sides
            .iter()
            .max_by_key(|s| s.estimated_free_space)
            .map(|s| (*s).clone())
            .ok_or_else(|| StoreError::not_found("side", pool))
    }

    /// Current weight of the device group serving this side's volume.
    /// Sides whose group cannot be resolved sort as weight 0.
    fn weight_for_side(&self, side: &TapeSide) -> i64 {
        let Some(volume) = self.tables.volumes.get(&side.vid) else {
            return 0;
        };
        let Some(mapping) = self
            .tables
            .dgnmaps
            .iter()
            .find(|m| m.model == volume.model && m.library == volume.library)
        else {
            return 0;
        };
        self.tables
            .weights
            .get(&mapping.dgn)
            .map(|w| w.weight)
            .unwrap_or(0)
    }

    // --- pools ---

    pub fn get_pool(&self, name: &str) -> Result<TapePool, StoreError> {
        self.tables
            .pools
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found("pool", name))
    }

    pub fn insert_pool(&mut self, pool: TapePool) -> Result<(), StoreError> {
        if self.tables.pools.contains_key(&pool.name) {
            return Err(StoreError::exists("pool", &pool.name));
        }
        self.tables.pools.insert(pool.name.clone(), pool);
        Ok(())
    }

    pub fn update_pool(&mut self, pool: &TapePool) -> Result<(), StoreError> {
        match self.tables.pools.get_mut(&pool.name) {
            Some(row) => {
                *row = pool.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("pool", &pool.name)),
        }
    }

    pub fn delete_pool(&mut self, name: &str) -> Result<(), StoreError> {
        self.tables
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("pool", name))
    }

    pub fn list_pools(&self) -> Vec<TapePool> {
        self.tables.pools.values().cloned().collect()
    }

    // --- libraries ---

    pub fn get_library(&self, name: &str) -> Result<TapeLibrary, StoreError> {
        self.tables
            .libraries
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::not_found("library", name))
    }

    pub fn insert_library(&mut self, library: TapeLibrary) -> Result<(), StoreError> {
        if self.tables.libraries.contains_key(&library.name) {
            return Err(StoreError::exists("library", &library.name));
        }
        self.tables.libraries.insert(library.name.clone(), library);
        Ok(())
    }

    pub fn update_library(&mut self, library: &TapeLibrary) -> Result<(), StoreError> {
        match self.tables.libraries.get_mut(&library.name) {
            Some(row) => {
                *row = library.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("library", &library.name)),
        }
    }

    pub fn delete_library(&mut self, name: &str) -> Result<(), StoreError> {
        self.tables
            .libraries
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("library", name))
    }

    pub fn list_libraries(&self) -> Vec<TapeLibrary> {
        self.tables.libraries.values().cloned().collect()
    }

    // --- models ---

    pub fn get_model(&self, model: &str) -> Result<TapeModel, StoreError> {
        self.tables
            .models
            .get(model)
            .cloned()
            .ok_or_else(|| StoreError::not_found("model", model))
    }

    pub fn insert_model(&mut self, model: TapeModel) -> Result<(), StoreError> {
        if self.tables.models.contains_key(&model.model) {
            return Err(StoreError::exists("model", &model.model));
        }
        self.tables.models.insert(model.model.clone(), model);
        Ok(())
    }

    pub fn update_model(&mut self, model: &TapeModel) -> Result<(), StoreError> {
        match self.tables.models.get_mut(&model.model) {
            Some(row) => {
                *row = model.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("model", &model.model)),
        }
    }

    pub fn delete_model(&mut self, model: &str) -> Result<(), StoreError> {
        self.tables
            .models
            .remove(model)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("model", model))
    }

    pub fn list_models(&self) -> Vec<TapeModel> {
        self.tables.models.values().cloned().collect()
    }

    // --- density mappings ---

    pub fn get_denmap(
        &self,
        model: &str,
        media_letter: &str,
        density: &str,
    ) -> Result<DensityMapping, StoreError> {
        self.tables
            .denmaps
            .iter()
            .find(|d| d.model == model && d.media_letter == media_letter && d.density == density)
            .cloned()
            .ok_or_else(|| {
                StoreError::not_found("denmap", format!("{model}/{media_letter}/{density}"))
            })
    }

    pub fn insert_denmap(&mut self, denmap: DensityMapping) -> Result<(), StoreError> {
        if self.tables.denmaps.iter().any(|d| {
            d.model == denmap.model
                && d.media_letter == denmap.media_letter
                && d.density == denmap.density
        }) {
            return Err(StoreError::exists(
                "denmap",
                format!(
                    "{}/{}/{}",
                    denmap.model, denmap.media_letter, denmap.density
                ),
            ));
        }
        self.tables.denmaps.push(denmap);
        Ok(())
    }

    pub fn delete_denmap(
        &mut self,
        model: &str,
        media_letter: &str,
        density: &str,
    ) -> Result<(), StoreError> {
        let before = self.tables.denmaps.len();
        self.tables.denmaps.retain(|d| {
            !(d.model == model && d.media_letter == media_letter && d.density == density)
        });
        if self.tables.denmaps.len() == before {
            return Err(StoreError::not_found(
                "denmap",
                format!("{model}/{media_letter}/{density}"),
            ));
        }
        Ok(())
    }

    pub fn list_denmaps(&self) -> Vec<DensityMapping> {
        self.tables.denmaps.clone()
    }

    // --- device group mappings ---

    pub fn get_dgnmap(&self, model: &str, library: &str) -> Result<DeviceGroupMapping, StoreError> {
        self.tables
            .dgnmaps
            .iter()
            .find(|m| m.model == model && m.library == library)
            .cloned()
            .ok_or_else(|| StoreError::not_found("dgnmap", format!("{model}/{library}")))
    }

    pub fn insert_dgnmap(&mut self, mapping: DeviceGroupMapping) -> Result<(), StoreError> {
        if self
            .tables
            .dgnmaps
            .iter()
            .any(|m| m.model == mapping.model && m.library == mapping.library)
        {
            return Err(StoreError::exists(
                "dgnmap",
                format!("{}/{}", mapping.model, mapping.library),
            ));
        }
        self.tables.dgnmaps.push(mapping);
        Ok(())
    }

    pub fn delete_dgnmap(&mut self, model: &str, library: &str) -> Result<(), StoreError> {
        let before = self.tables.dgnmaps.len();
        self.tables
            .dgnmaps
            .retain(|m| !(m.model == model && m.library == library));
        if self.tables.dgnmaps.len() == before {
            return Err(StoreError::not_found(
                "dgnmap",
                format!("{model}/{library}"),
            ));
        }
        Ok(())
    }

    pub fn list_dgnmaps(&self) -> Vec<DeviceGroupMapping> {
        self.tables.dgnmaps.clone()
    }

    // --- device group weights ---

    pub fn get_weight(&self, dgn: &str) -> Result<DeviceGroupWeight, StoreError> {
        self.tables
            .weights
            .get(dgn)
            .cloned()
            .ok_or_else(|| StoreError::not_found("weight", dgn))
    }

    /// Insert-or-replace; the weight row follows its mapping's lifecycle.
    pub fn put_weight(&mut self, weight: DeviceGroupWeight) {
        self.tables.weights.insert(weight.dgn.clone(), weight);
    }

    pub fn delete_weight(&mut self, dgn: &str) {
        self.tables.weights.remove(dgn);
    }

    // --- tags ---

    pub fn get_tag(&self, vid: &str) -> Result<Tag, StoreError> {
        self.tables
            .tags
            .get(vid)
            .cloned()
            .ok_or_else(|| StoreError::not_found("tag", vid))
    }

    pub fn insert_tag(&mut self, tag: Tag) -> Result<(), StoreError> {
        if self.tables.tags.contains_key(&tag.vid) {
            return Err(StoreError::exists("tag", &tag.vid));
        }
        self.tables.tags.insert(tag.vid.clone(), tag);
        Ok(())
    }

    pub fn update_tag(&mut self, tag: &Tag) -> Result<(), StoreError> {
        match self.tables.tags.get_mut(&tag.vid) {
            Some(row) => {
                *row = tag.clone();
                Ok(())
            }
            None => Err(StoreError::not_found("tag", &tag.vid)),
        }
    }

    pub fn delete_tag(&mut self, vid: &str) -> Result<(), StoreError> {
        self.tables
            .tags
            .remove(vid)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("tag", vid))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.committed {
            *self.tables = std::mem::take(&mut self.undo);
        }
    }
}
