use resql::core::buffer::{Buf, RawBuf};
use resql::core::cmd;
use resql::core::meta::Meta;

#[test]
fn test_init_round_trip() {
    let mut rand = [0u8; cmd::INIT_RAND_LEN];
    for (i, b) in rand.iter_mut().enumerate() {
        *b = i as u8;
    }

    let mut buf = Buf::new();
    cmd::encode_init(&mut buf, 111, 222, &rand);

    let decoded = cmd::decode_init(&mut RawBuf::new(buf.data())).unwrap();
    assert_eq!(decoded.realtime, 111);
    assert_eq!(decoded.monotonic, 222);
    assert_eq!(decoded.rand, rand);
}

#[test]
fn test_init_rejects_short_payload() {
    let mut buf = Buf::new();
    buf.put_u64(1);
    buf.put_u64(2);
    buf.put_raw(&[0u8; 100]);

    assert!(cmd::decode_init(&mut RawBuf::new(buf.data())).is_err());
}

#[test]
fn test_clock_round_trip() {
    let mut buf = Buf::new();
    cmd::encode_clock(&mut buf, 5000, 6000);

    let decoded = cmd::decode_clock(&mut RawBuf::new(buf.data())).unwrap();
    assert_eq!(decoded.realtime, 5000);
    assert_eq!(decoded.monotonic, 6000);
}

#[test]
fn test_meta_round_trip() {
    let mut meta = Meta::new("prod");
    meta.parse_uris("tcp://a@10.0.0.1:7600 tcp://b@10.0.0.2:7600")
        .unwrap();
    meta.term = 4;

    let mut buf = Buf::new();
    cmd::encode_meta(&mut buf, &meta);

    let decoded = cmd::decode_meta(&mut RawBuf::new(buf.data())).unwrap();
    assert_eq!(decoded, meta);
}

#[test]
fn test_connect_round_trip() {
    let mut buf = Buf::new();
    cmd::encode_connect(&mut buf, "app-1", "127.0.0.1:5000", "127.0.0.1:6000");

    let decoded = cmd::decode_connect(&mut RawBuf::new(buf.data())).unwrap();
    assert_eq!(decoded.name, "app-1");
    assert_eq!(decoded.local, "127.0.0.1:5000");
    assert_eq!(decoded.remote, "127.0.0.1:6000");
}

#[test]
fn test_disconnect_round_trip() {
    let mut buf = Buf::new();
    cmd::encode_disconnect(&mut buf, "app-1", true);

    let decoded = cmd::decode_disconnect(&mut RawBuf::new(buf.data())).unwrap();
    assert_eq!(decoded.name, "app-1");
    assert!(decoded.clean);
}

#[test]
fn test_log_round_trip() {
    let mut buf = Buf::new();
    cmd::encode_log(&mut buf, "WARN", "Sending snapshot[42] to: node1");

    let decoded = cmd::decode_log(&mut RawBuf::new(buf.data())).unwrap();
    assert_eq!(decoded.level, "WARN");
    assert_eq!(decoded.log, "Sending snapshot[42] to: node1");
}
