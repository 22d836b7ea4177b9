use bytes::{Bytes, BytesMut};
use resql::core::protocol::{Msg, MsgCodec, MsgRc};
use tokio_util::codec::{Decoder, Encoder};

fn round_trip(msg: Msg) {
    let bytes = MsgCodec::encode_to_vec(msg.clone()).unwrap();

    // Total length counts itself.
    let total = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    assert_eq!(total as usize, bytes.len());

    let mut src = BytesMut::from(&bytes[..]);
    let decoded = MsgCodec.decode(&mut src).unwrap().unwrap();
    assert_eq!(decoded, msg);
    assert!(src.is_empty());
}

#[test]
fn test_connect_round_trips() {
    round_trip(Msg::ConnectReq {
        flags: 0,
        protocol: "resql".to_owned(),
        cluster: "cluster".to_owned(),
        name: "client-7".to_owned(),
    });
    round_trip(Msg::ConnectResp {
        rc: MsgRc::Ok,
        seq: 42,
        term: 3,
        nodes: "tcp://node0@127.0.0.1:7600 ".to_owned(),
    });
    round_trip(Msg::DisconnectReq {
        rc: MsgRc::Err,
        flags: 1,
    });
    round_trip(Msg::DisconnectResp {
        rc: MsgRc::Ok,
        flags: 0,
    });
}

#[test]
fn test_client_round_trips() {
    round_trip(Msg::ClientReq {
        readonly: true,
        seq: 9,
        batch: Bytes::from_static(b"\x06\x02stmt\x02\x07\x09"),
    });
    round_trip(Msg::ClientResp {
        batch: Bytes::from_static(b"\x00\x09"),
    });
}

#[test]
fn test_raft_round_trips() {
    round_trip(Msg::AppendReq {
        term: 7,
        prev_index: 100,
        prev_term: 6,
        leader_commit: 99,
        round: 12,
        entries: Bytes::from_static(b"some entry bytes"),
    });
    round_trip(Msg::AppendResp {
        term: 7,
        index: 101,
        round: 12,
        success: true,
    });
    round_trip(Msg::PrevoteReq {
        term: 8,
        last_term: 7,
        last_index: 101,
    });
    round_trip(Msg::PrevoteResp {
        term: 8,
        index: 101,
        granted: true,
    });
    round_trip(Msg::ReqvoteReq {
        term: 8,
        last_term: 7,
        last_index: 101,
    });
    round_trip(Msg::ReqvoteResp {
        term: 8,
        index: 101,
        granted: false,
    });
}

#[test]
fn test_snapshot_and_misc_round_trips() {
    round_trip(Msg::SnapshotReq {
        term: 9,
        ss_term: 8,
        ss_index: 1000,
        offset: 4096,
        done: false,
        data: Bytes::from(vec![0xAB; 1024]),
    });
    round_trip(Msg::SnapshotResp {
        term: 9,
        success: true,
        done: true,
    });
    round_trip(Msg::InfoReq {
        data: Bytes::from_static(b"stats"),
    });
    round_trip(Msg::ShutdownReq { now: true });
}

#[test]
fn test_partial_frame_returns_none() {
    let bytes = MsgCodec::encode_to_vec(Msg::AppendResp {
        term: 1,
        index: 2,
        round: 3,
        success: false,
    })
    .unwrap();

    for cut in 0..bytes.len() {
        let mut src = BytesMut::from(&bytes[..cut]);
        assert!(MsgCodec.decode(&mut src).unwrap().is_none(), "cut {cut}");
    }
}

#[test]
fn test_two_messages_in_one_buffer() {
    let a = Msg::ShutdownReq { now: false };
    let b = Msg::AppendResp {
        term: 1,
        index: 2,
        round: 0,
        success: true,
    };

    let mut src = BytesMut::new();
    MsgCodec.encode(a.clone(), &mut src).unwrap();
    MsgCodec.encode(b.clone(), &mut src).unwrap();

    assert_eq!(MsgCodec.decode(&mut src).unwrap().unwrap(), a);
    assert_eq!(MsgCodec.decode(&mut src).unwrap().unwrap(), b);
    assert!(MsgCodec.decode(&mut src).unwrap().is_none());
}

#[test]
fn test_garbage_length_is_an_error() {
    // Length below the fixed header.
    let mut src = BytesMut::from(&[3u8, 0, 0, 0, 0][..]);
    assert!(MsgCodec.decode(&mut src).is_err());

    // Unknown type byte.
    let mut src = BytesMut::from(&[6u8, 0, 0, 0, 0xEE, 0][..]);
    assert!(MsgCodec.decode(&mut src).is_err());
}
