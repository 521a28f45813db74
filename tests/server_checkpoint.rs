mod common;

use common::{enter_volume, seed_reference_data, start_server, MB};
use std::sync::Arc;
use tapevmgr::protocol::codes;
use tapevmgr::server::serve;
use tapevmgr::{
    ClientConfig, Grant, ModifyTapeRequest, Privilege, ServerConfig, StaticPrivileges, VmgrClient,
    VolumeStore,
};

#[test]
fn modify_operations_update_the_inventory() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    client.enter_pool("POOL2", 300, 300).unwrap();
    client
        .modify_tape(&ModifyTapeRequest {
            vid: "VID001".into(),
            poolname: "POOL2".into(),
            ..Default::default()
        })
        .unwrap();

    let moved = client.query_tape("VID001", 0).unwrap();
    assert_eq!(moved.poolname, "POOL2");
    assert_eq!(client.query_pool("POOL1").unwrap().capacity, 0);
    assert_eq!(client.query_pool("POOL2").unwrap().capacity, MB);

    client.modify_pool("POOL2", 400, -1).unwrap();
    let pool = client.query_pool("POOL2").unwrap();
    assert_eq!(pool.uid, 400);
    assert_eq!(pool.gid, 300);

    client.modify_library("LIB1", 30, -1).unwrap();
    let library = client.query_library("LIB1").unwrap();
    assert_eq!(library.capacity, 30);
    assert_eq!(library.nb_free_slots, 29); // one volume occupies a slot

    client.modify_model("M1", "", 25).unwrap();
    assert_eq!(client.query_model("M1").unwrap().media_cost, 25);
}

#[test]
fn reference_entity_deletion_guards() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    // Pool holds capacity, library holds a cartridge.
    assert_eq!(
        client.delete_pool("POOL1").unwrap_err().remote_code(),
        Some(codes::EEXIST)
    );
    assert_eq!(
        client.delete_library("LIB1").unwrap_err().remote_code(),
        Some(codes::EEXIST)
    );

    client.delete_tape("VID001").unwrap();
    client.delete_dgnmap("M1", "LIB1").unwrap();
    client.delete_denmap("M1", "A", "den1").unwrap();
    client.delete_model("M1").unwrap();
    client.delete_library("LIB1").unwrap();
    client.delete_pool("POOL1").unwrap();
    assert!(client.list_pools().unwrap().is_empty());
}

#[test]
fn snapshot_survives_daemon_restart() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("vmgr.json");
    let config = ServerConfig {
        bind: "127.0.0.1:0".into(),
        snapshot: Some(snapshot.clone()),
        ..Default::default()
    };

    let addr;
    {
        let store = VolumeStore::open(snapshot.clone()).unwrap();
        let server = serve(
            &config,
            Arc::new(store),
            Arc::new(StaticPrivileges::allow_all()),
        )
        .unwrap();
        addr = server.local_addr();
        let mut client_config = ClientConfig::new(addr.ip().to_string(), addr.port());
        client_config.retry_interval_secs = 0;
        let client = VmgrClient::new(client_config).with_identity(100, 50);
        seed_reference_data(&client);
        enter_volume(&client, "VID001");
        server.initiate_shutdown();
    }

    let store = VolumeStore::open(snapshot).unwrap();
    let server = serve(
        &config,
        Arc::new(store),
        Arc::new(StaticPrivileges::allow_all()),
    )
    .unwrap();
    let addr = server.local_addr();
    let mut client_config = ClientConfig::new(addr.ip().to_string(), addr.port());
    client_config.retry_interval_secs = 0;
    let client = VmgrClient::new(client_config).with_identity(100, 50);

    let info = client.query_tape("VID001", 0).unwrap();
    assert_eq!(info.poolname, "POOL1");
    assert_eq!(info.estimated_free_space, MB);
}

#[test]
fn remote_shutdown_drains_the_server() {
    let (server, client) = start_server(6, 300);
    client.shutdown().unwrap();
    // The handle observes the request and wait() returns promptly.
    assert!(server.shutdown_requested() || {
        std::thread::sleep(std::time::Duration::from_millis(200));
        server.shutdown_requested()
    });
    server.wait();
}

#[test]
fn privileges_are_enforced_per_request() {
    let config = ServerConfig {
        bind: "127.0.0.1:0".into(),
        ..Default::default()
    };
    let privileges = StaticPrivileges::new(vec![Grant {
        uid: 100,
        gid: None,
        privilege: Privilege::Admin,
    }]);
    let server = serve(
        &config,
        Arc::new(VolumeStore::in_memory()),
        Arc::new(privileges),
    )
    .unwrap();
    let addr = server.local_addr();
    let make_client = |uid| {
        let mut client_config = ClientConfig::new(addr.ip().to_string(), addr.port());
        client_config.retry_interval_secs = 0;
        client_config.max_retries = Some(2);
        VmgrClient::new(client_config).with_identity(uid, 50)
    };

    let admin = make_client(100);
    let anon = make_client(9999);

    admin.enter_pool("POOL1", 0, 0).unwrap();
    assert_eq!(
        anon.enter_pool("POOL2", 0, 0).unwrap_err().remote_code(),
        Some(codes::EACCES)
    );
    // Queries stay open to everyone.
    assert_eq!(anon.query_pool("POOL1").unwrap().capacity, 0);
}
