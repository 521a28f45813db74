mod common;

use common::{enter_volume, seed_reference_data, start_server};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;
use tapevmgr::protocol::{
    codes, read_reply, write_request, RepType, ReqType, LIST_BEGIN, LIST_CONTINUE, LIST_END,
    VMGR_MAGIC2,
};
use tapevmgr::wire::{WireReader, WireWriter};

#[test]
fn list_pools_spans_multiple_batches() {
    let (_server, client) = start_server(6, 300);
    // Enough pools that the 4 KB reply buffer cannot hold them all.
    for i in 0..150 {
        client.enter_pool(&format!("pool{i:03}"), 0, 0).unwrap();
    }
    let pools = client.list_pools().unwrap();
    assert_eq!(pools.len(), 150);
    let mut names: Vec<&str> = pools.iter().map(|p| p.name.as_str()).collect();
    names.dedup();
    assert_eq!(names.len(), 150);
    assert!(names.contains(&"pool000") && names.contains(&"pool149"));
}

#[test]
fn list_tapes_reports_every_side() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);
    for i in 0..5 {
        enter_volume(&client, &format!("VID{i:03}"));
    }
    let entries = client.list_tapes().unwrap();
    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.poolname == "POOL1"));
    assert!(entries.iter().all(|e| e.estimated_free_space == common::MB));
}

#[test]
fn reference_lists_round_trip() {
    let (_server, client) = start_server(6, 300);
    seed_reference_data(&client);

    let models = client.list_models().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].media_letter, "A");

    let libraries = client.list_libraries().unwrap();
    assert_eq!(libraries.len(), 1);
    assert_eq!(libraries[0].nb_free_slots, 20);

    let denmaps = client.list_denmaps().unwrap();
    assert_eq!(denmaps.len(), 1);
    assert_eq!(denmaps[0].native_capacity, common::MB);

    let dgnmaps = client.list_dgnmaps().unwrap();
    assert_eq!(dgnmaps.len(), 1);
    assert_eq!(dgnmaps[0].dgn, "DG1");
}

fn list_round_body(flag: u16) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32(100);
    w.put_u32(50);
    w.put_u16(flag);
    w.into_bytes()
}

#[test]
fn idle_list_cursor_is_timed_out() {
    let (server, client) = start_server(6, 1);
    for i in 0..150 {
        client.enter_pool(&format!("pool{i:03}"), 0, 0).unwrap();
    }

    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    write_request(&mut stream, VMGR_MAGIC2, ReqType::ListPool, &list_round_body(LIST_BEGIN))
        .unwrap();
    let data = read_reply(&mut stream).unwrap();
    assert_eq!(data.rep_type, RepType::MsgData);
    let irc = read_reply(&mut stream).unwrap();
    assert_eq!(irc.rep_type, RepType::Irc);

    // Sit past the idle timeout instead of continuing.
    thread::sleep(Duration::from_millis(1500));
    let rc = read_reply(&mut stream).unwrap();
    assert_eq!(rc.rep_type, RepType::Rc);
    let mut r = WireReader::new(&rc.payload);
    assert_eq!(r.get_i32().unwrap(), codes::SETIMEDOUT);
}

#[test]
fn worker_exhaustion_is_reported_as_not_active() {
    let (server, client) = start_server(1, 30);
    for i in 0..150 {
        client.enter_pool(&format!("pool{i:03}"), 0, 0).unwrap();
    }

    // Park the only worker mid-list.
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    write_request(&mut stream, VMGR_MAGIC2, ReqType::ListPool, &list_round_body(LIST_BEGIN))
        .unwrap();
    let data = read_reply(&mut stream).unwrap();
    assert_eq!(data.rep_type, RepType::MsgData);
    let irc = read_reply(&mut stream).unwrap();
    assert_eq!(irc.rep_type, RepType::Irc);

    // The bounded-retry client now runs out of attempts.
    let err = client.query_pool("pool000").unwrap_err();
    assert!(matches!(
        err,
        tapevmgr::ClientError::RetriesExhausted { .. }
    ));

    // Release the worker and finish the list cleanly.
    write_request(
        &mut stream,
        VMGR_MAGIC2,
        ReqType::ListPool,
        &list_round_body(LIST_CONTINUE),
    )
    .unwrap();
    let data = read_reply(&mut stream).unwrap();
    assert_eq!(data.rep_type, RepType::MsgData);
    let irc = read_reply(&mut stream).unwrap();
    assert_eq!(irc.rep_type, RepType::Irc);
    write_request(
        &mut stream,
        VMGR_MAGIC2,
        ReqType::ListPool,
        &list_round_body(LIST_END),
    )
    .unwrap();
    let rc = read_reply(&mut stream).unwrap();
    assert_eq!(rc.rep_type, RepType::Rc);
    let mut r = WireReader::new(&rc.payload);
    assert_eq!(r.get_i32().unwrap(), 0);

    drop(stream);
    // Worker slot freed again.
    assert_eq!(client.query_pool("pool000").unwrap().capacity, 0);
}
