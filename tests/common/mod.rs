#![allow(dead_code)]

use std::sync::Arc;
use tapevmgr::server::{serve, ServerHandle};
use tapevmgr::{
    ClientConfig, EnterTapeRequest, ServerConfig, StaticPrivileges, VmgrClient, VolumeStore,
};

pub const MB: u64 = 1_000_000;

/// In-memory daemon on an ephemeral loopback port, everything permitted,
/// plus a client pointed at it.
pub fn start_server(workers: usize, list_idle_secs: u64) -> (ServerHandle, VmgrClient) {
    let config = ServerConfig {
        bind: "127.0.0.1:0".into(),
        workers,
        list_idle_timeout_secs: list_idle_secs,
        snapshot: None,
        grants: Vec::new(),
    };
    let handle = serve(
        &config,
        Arc::new(VolumeStore::in_memory()),
        Arc::new(StaticPrivileges::allow_all()),
    )
    .expect("bind test server");
    let addr = handle.local_addr();
    let mut client_config = ClientConfig::new(addr.ip().to_string(), addr.port());
    client_config.retry_interval_secs = 0;
    client_config.max_retries = Some(20);
    let client = VmgrClient::new(client_config).with_identity(100, 50);
    (handle, client)
}

/// Library LIB1, model M1/A, density den1 at 1 MB native, device group DG1
/// and pool POOL1.
pub fn seed_reference_data(client: &VmgrClient) {
    client.enter_library("LIB1", 20, 0).expect("library");
    client
        .enter_model(&tapevmgr::types::TapeModel {
            model: "M1".into(),
            media_letter: "A".into(),
            media_cost: 10,
        })
        .expect("model");
    client.enter_pool("POOL1", 0, 0).expect("pool");
    client
        .enter_denmap(&tapevmgr::types::DensityMapping {
            model: "M1".into(),
            media_letter: "A".into(),
            density: "den1".into(),
            native_capacity: MB,
        })
        .expect("denmap");
    client.enter_dgnmap("DG1", "M1", "LIB1").expect("dgnmap");
}

pub fn enter_volume(client: &VmgrClient, vid: &str) {
    client
        .enter_tape(&EnterTapeRequest {
            vid: vid.into(),
            library: "LIB1".into(),
            density: "den1".into(),
            model: "M1".into(),
            nbsides: 1,
            poolname: "POOL1".into(),
            ..Default::default()
        })
        .expect("enter tape");
}
