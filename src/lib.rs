//! Tape volume manager: inventory, allocation and accounting of tape
//! media, served over a compact binary RPC protocol.
//!
//! The daemon ([`server`]) owns the inventory store and answers enter /
//! modify / delete / query / list requests for volumes, pools, libraries,
//! cartridge models and the density and device-group mappings, plus the
//! allocation path (`GET_TAPE` / `UPDATE_TAPE`) used by writers. The
//! [`client`] speaks the same protocol with the historical
//! retry-until-active discipline.

pub mod alloc;
pub mod client;
pub mod config;
pub mod error;
pub mod privilege;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod store;
pub mod types;
pub mod wire;

pub use client::{EnterTapeRequest, ModifyTapeRequest, TapeInfo, TapeListEntry, VmgrClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{ClientError, HandlerError, StoreError};
pub use privilege::{Grant, Privilege, PrivilegeChecker, StaticPrivileges};
pub use retry::RetryPolicy;
pub use store::VolumeStore;
pub use types::Allocation;
