//! Persistent entities of the tape inventory.

use serde::{Deserialize, Serialize};

/// Side status bits. A side with status 0 is free for allocation.
pub mod status {
    pub const TAPE_FULL: i32 = 0x01;
    pub const TAPE_BUSY: i32 = 0x02;
    pub const TAPE_RDONLY: i32 = 0x04;
    pub const EXPORTED: i32 = 0x08;
    pub const DISABLED: i32 = 0x10;
    pub const ARCHIVED: i32 = 0x20;
}

/// Supported volume label types.
pub const LABEL_TYPES: [&str; 4] = ["al", "aul", "nl", "sl"];

/// Pool every volume falls into when the caller leaves the name empty.
pub const DEFAULT_POOL: &str = "default";

/// One physical cartridge. Sides live in their own table keyed by
/// (vid, side index).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapeVolume {
    pub vid: String,
    pub vsn: String,
    pub library: String,
    pub density: String,
    pub lbltype: String,
    pub model: String,
    pub media_letter: String,
    pub manufacturer: String,
    pub sn: String,
    pub nbsides: u16,
    /// Creation time, seconds since the epoch.
    pub etime: i64,
    pub rhost: String,
    pub whost: String,
    pub rjid: i32,
    pub wjid: i32,
    pub rcount: i32,
    pub wcount: i32,
    pub rtime: i64,
    pub wtime: i64,
}

/// Unit of allocation: one independently writable capacity slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapeSide {
    pub vid: String,
    pub side: u16,
    pub poolname: String,
    pub status: i32,
    pub estimated_free_space: u64,
    pub nbfiles: i32,
}

impl TapeSide {
    pub fn is_free(&self) -> bool {
        self.status == 0
    }
}

/// Named grouping of sides with shared ownership and aggregate accounting.
/// `capacity` and `tot_free_space` are sums over the member sides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapePool {
    pub name: String,
    /// Owning uid; 0 means unrestricted.
    pub uid: u32,
    /// Owning gid; 0 means unrestricted.
    pub gid: u32,
    pub capacity: u64,
    pub tot_free_space: u64,
}

/// Robotic library, tracked only by slot occupancy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapeLibrary {
    pub name: String,
    pub capacity: i32,
    pub nb_free_slots: i32,
    pub status: i32,
}

/// Cartridge model; the media letter disambiguates media generations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TapeModel {
    pub model: String,
    pub media_letter: String,
    pub media_cost: i32,
}

/// (model, media letter, density) -> native capacity in bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DensityMapping {
    pub model: String,
    pub media_letter: String,
    pub density: String,
    pub native_capacity: u64,
}

/// (model, library) -> device group name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceGroupMapping {
    pub dgn: String,
    pub model: String,
    pub library: String,
}

/// Allocation tie-breaker: lower weight wins; the weight grows by
/// `delta_weight` every time a side of this group is handed out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceGroupWeight {
    pub dgn: String,
    pub weight: i64,
    pub delta_weight: i64,
}

/// Free-text annotation, one per volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tag {
    pub vid: String,
    pub text: String,
}

/// Reply of a successful `GET_TAPE` allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub vid: String,
    pub vsn: String,
    pub dgn: String,
    pub density: String,
    pub lbltype: String,
    pub model: String,
    pub side: u16,
    /// Sequence hint: one past the files already on the side.
    pub fseq: i32,
    pub estimated_free_space: u64,
}
