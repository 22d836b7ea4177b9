use resql::core::buffer::Buf;
use resql::core::log::entry;

fn sample_entry(data: &[u8]) -> Vec<u8> {
    let mut buf = Buf::new();
    entry::encode(&mut buf, 3, 7, 11, 4, data);
    buf.into_vec()
}

#[test]
fn test_encode_decode_round_trip() {
    let e = sample_entry(b"payload");

    assert_eq!(entry::len(&e) as usize, e.len());
    assert_eq!(entry::term(&e), 3);
    assert_eq!(entry::seq(&e), 7);
    assert_eq!(entry::cid(&e), 11);
    assert_eq!(entry::flags(&e), 4);
    assert_eq!(entry::data(&e), b"payload");

    assert_eq!(entry::decode(&e), Some(e.len()));
}

#[test]
fn test_any_flipped_byte_fails_decode() {
    let e = sample_entry(b"payload");

    for i in 0..e.len() {
        let mut bad = e.clone();
        bad[i] ^= 0x01;
        assert_eq!(entry::decode(&bad), None, "byte {i} flip went unnoticed");
    }
}

#[test]
fn test_decode_rejects_short_input() {
    let e = sample_entry(b"data");
    assert_eq!(entry::decode(&e[..entry::HEADER_SIZE - 1]), None);
    assert_eq!(entry::decode(&e[..e.len() - 1]), None);
}

#[test]
fn test_encode_into_matches_buf_encode() {
    let via_buf = sample_entry(b"same bytes");

    let mut raw = vec![0u8; via_buf.len()];
    let n = entry::encode_into(&mut raw, 3, 7, 11, 4, b"same bytes");
    assert_eq!(n, via_buf.len());
    assert_eq!(raw, via_buf);
}

#[test]
fn test_iter_steps_entry_boundaries() {
    let mut buf = Buf::new();
    entry::encode(&mut buf, 1, 0, 0, 0, b"first");
    entry::encode(&mut buf, 1, 0, 0, 0, b"second");
    entry::encode(&mut buf, 2, 0, 0, 0, b"");
    let region = buf.into_vec();

    let entries: Vec<&[u8]> = entry::iter(&region).collect();
    assert_eq!(entries.len(), 3);
    assert_eq!(entry::data(entries[0]), b"first");
    assert_eq!(entry::data(entries[1]), b"second");
    assert_eq!(entry::data(entries[2]), b"");
    assert_eq!(entry::term(entries[2]), 2);
}

#[test]
fn test_empty_payload_entry() {
    let e = sample_entry(b"");
    assert_eq!(e.len(), entry::HEADER_SIZE);
    assert_eq!(entry::decode(&e), Some(entry::HEADER_SIZE));
    assert_eq!(entry::data(&e), b"");
}
