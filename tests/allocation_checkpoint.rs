mod common;

use common::{enter_volume, seed_reference_data, start_server, MB};
use tapevmgr::protocol::codes;
use tapevmgr::types::status;

#[test]
fn write_cycle_end_to_end() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    let pool = client.query_pool("POOL1").unwrap();
    assert_eq!(pool.capacity, MB);
    assert_eq!(pool.tot_free_space, MB);

    let allocation = client.get_tape("POOL1", 500_000).unwrap();
    assert_eq!(allocation.vid, "VID001");
    assert_eq!(allocation.dgn, "DG1");
    assert_eq!(allocation.fseq, 1);
    assert_eq!(allocation.estimated_free_space, MB);

    let busy = client.query_tape("VID001", 0).unwrap();
    assert_eq!(busy.status & status::TAPE_BUSY, status::TAPE_BUSY);

    client
        .update_tape("VID001", 0, 500_000, 0, 3, 0)
        .unwrap();

    let after = client.query_tape("VID001", 0).unwrap();
    assert_eq!(after.estimated_free_space, 500_000);
    assert_eq!(after.nbfiles, 3);
    assert_eq!(after.status, 0);
    assert_eq!(client.query_pool("POOL1").unwrap().tot_free_space, MB - 500_000);
}

#[test]
fn exhausted_pool_is_enospc() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    client.get_tape("POOL1", 1).unwrap();
    let err = client.get_tape("POOL1", 1).unwrap_err();
    assert_eq!(err.remote_code(), Some(codes::ENOSPC));
}

#[test]
fn concurrent_allocations_get_distinct_sides() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");
    enter_volume(&client, "VID002");

    let first = client.get_tape("POOL1", 1).unwrap();
    let second = client.get_tape("POOL1", 1).unwrap();
    assert_ne!(first.vid, second.vid);
}

#[test]
fn delete_is_refused_while_files_exist() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    client.get_tape("POOL1", 1).unwrap();
    client.update_tape("VID001", 0, 1_000, 0, 1, 0).unwrap();
    let err = client.delete_tape("VID001").unwrap_err();
    assert_eq!(err.remote_code(), Some(codes::EEXIST));

    client.reclaim("VID001").unwrap();
    client.delete_tape("VID001").unwrap();
    let err = client.query_tape("VID001", 0).unwrap_err();
    assert_eq!(err.remote_code(), Some(codes::ENOENT));
}

#[test]
fn full_volume_accepts_no_further_writes() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    client.get_tape("POOL1", MB).unwrap();
    client.update_tape("VID001", 0, MB, 0, 1, 0).unwrap();

    let info = client.query_tape("VID001", 0).unwrap();
    assert_eq!(info.estimated_free_space, 0);
    assert_eq!(info.status & status::TAPE_FULL, status::TAPE_FULL);

    let err = client.get_tape("POOL1", 1).unwrap_err();
    assert_eq!(err.remote_code(), Some(codes::ENOSPC));
}

#[test]
fn duplicate_volume_entry_is_eexist() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    let err = client
        .enter_tape(&tapevmgr::EnterTapeRequest {
            vid: "VID001".into(),
            library: "LIB1".into(),
            density: "den1".into(),
            model: "M1".into(),
            nbsides: 1,
            poolname: "POOL1".into(),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err.remote_code(), Some(codes::EEXIST));
}

#[test]
fn entering_against_missing_pool_reports_text() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);

    let err = client
        .enter_tape(&tapevmgr::EnterTapeRequest {
            vid: "VID009".into(),
            library: "LIB1".into(),
            density: "den1".into(),
            model: "M1".into(),
            nbsides: 1,
            poolname: "NOPOOL".into(),
            ..Default::default()
        })
        .unwrap_err();
    match err {
        tapevmgr::ClientError::Remote { code, message } => {
            assert_eq!(code, codes::EINVAL);
            assert_eq!(message.as_deref(), Some("No such pool"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn mount_notification_updates_counters() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    client.tpmounted("VID001", true, 777).unwrap();
    client.tpmounted("VID001", false, 778).unwrap();

    let info = client.query_tape("VID001", 0).unwrap();
    assert_eq!(info.wcount, 1);
    assert_eq!(info.rcount, 1);
    assert_eq!(info.wjid, 777);
    assert_eq!(info.rjid, 778);
    assert_eq!(info.whost, "127.0.0.1");
}

#[test]
fn tags_round_trip() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    enter_volume(&client, "VID001");

    client.set_tag("VID001", "archive set 7").unwrap();
    assert_eq!(client.get_tag("VID001").unwrap(), "archive set 7");
    client.set_tag("VID001", "archive set 8").unwrap();
    assert_eq!(client.get_tag("VID001").unwrap(), "archive set 8");
    client.del_tag("VID001").unwrap();
    assert_eq!(
        client.get_tag("VID001").unwrap_err().remote_code(),
        Some(codes::ENOENT)
    );
}
