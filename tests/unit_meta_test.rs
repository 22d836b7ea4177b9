use resql::core::buffer::{Buf, RawBuf};
use resql::core::meta::{Meta, Role};
use url::Url;

fn three_node_meta() -> Meta {
    let mut m = Meta::new("cluster");
    m.parse_uris(
        "tcp://node0@127.0.0.1:7600 tcp://node1@127.0.0.1:7601 tcp://node2@127.0.0.1:7602",
    )
    .unwrap();
    m
}

fn encode(m: &Meta) -> Vec<u8> {
    let mut buf = Buf::new();
    m.encode(&mut buf);
    buf.into_vec()
}

#[test]
fn test_parse_uris() {
    let m = three_node_meta();

    assert_eq!(m.nodes.len(), 3);
    assert_eq!(m.voter, 3);
    assert!(m.exists("node0"));
    assert!(m.exists("node2"));
    assert!(!m.exists("node3"));
    assert!(m.nodes.iter().all(|n| n.role == Role::Follower));
}

#[test]
fn test_encode_decode_round_trip() {
    let mut m = three_node_meta();
    m.term = 5;
    m.index = 77;
    m.set_leader("node1");

    let bytes = encode(&m);
    let decoded = Meta::decode(&mut RawBuf::new(&bytes)).unwrap();
    assert_eq!(m, decoded);
}

#[test]
fn test_round_trip_with_prev() {
    let mut m = three_node_meta();
    m.index = 10;
    assert!(m.add(Url::parse("tcp://node3@127.0.0.1:7603").unwrap()));
    m.index = 11;

    assert!(m.prev.is_some());

    let bytes = encode(&m);
    let decoded = Meta::decode(&mut RawBuf::new(&bytes)).unwrap();
    assert_eq!(m, decoded);
    assert_eq!(decoded.prev.as_ref().unwrap().index, 10);
}

#[test]
fn test_add_then_rollback_restores_bytewise() {
    let mut m = three_node_meta();
    m.index = 10;
    let original = encode(&m);

    assert!(m.add(Url::parse("tcp://node3@127.0.0.1:7603").unwrap()));
    m.index = 11;
    assert_ne!(encode(&m), original);

    m.rollback(10);
    assert_eq!(encode(&m), original);
    assert!(m.prev.is_none());
}

#[test]
fn test_rollback_keeps_committed_change() {
    let mut m = three_node_meta();
    m.index = 10;
    assert!(m.add(Url::parse("tcp://node3@127.0.0.1:7603").unwrap()));
    m.index = 11;

    // Truncation above the predecessor's index leaves the change alone.
    m.rollback(11);
    assert!(m.exists("node3"));
}

#[test]
fn test_add_rejects_duplicates() {
    let mut m = three_node_meta();

    // Duplicate name.
    assert!(!m.add(Url::parse("tcp://node0@127.0.0.1:9999").unwrap()));
    // Duplicate host:port.
    assert!(!m.add(Url::parse("tcp://fresh@127.0.0.1:7600").unwrap()));
    // Missing name.
    assert!(!m.add(Url::parse("tcp://127.0.0.1:9999").unwrap()));
}

#[test]
fn test_remove_and_complete() {
    let mut m = three_node_meta();

    assert!(m.remove("node2"));
    assert_eq!(m.voter, 2);
    assert!(m.prev.is_some());

    m.remove_prev();
    assert!(m.prev.is_none());

    assert!(!m.remove("node2"));
}

#[test]
fn test_set_leader_orders_uris() {
    let mut m = three_node_meta();
    m.set_leader("node1");

    assert_eq!(
        m.uris,
        "tcp://node1@127.0.0.1:7601 tcp://node0@127.0.0.1:7600 tcp://node2@127.0.0.1:7602 "
    );

    m.set_leader("node0");
    assert!(m.uris.starts_with("tcp://node0@127.0.0.1:7600 "));
    assert_eq!(m.nodes.iter().filter(|n| n.role == Role::Leader).count(), 1);
}

#[test]
fn test_too_many_initial_nodes_is_an_error() {
    let urls: Vec<String> = (0..17)
        .map(|i| format!("tcp://node{i}@127.0.0.1:{}", 7600 + i))
        .collect();

    let mut m = Meta::new("cluster");
    assert!(m.parse_uris(&urls.join(" ")).is_err());
}

#[test]
fn test_connected_flags() {
    let mut m = three_node_meta();

    m.set_connected("node1");
    assert!(m.nodes.iter().find(|n| n.name == "node1").unwrap().connected);

    m.clear_connection();
    assert!(m.nodes.iter().all(|n| !n.connected));
}
