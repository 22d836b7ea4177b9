use resql::core::buffer::{Buf, RawBuf};

#[test]
fn test_scalar_round_trip() {
    let mut b = Buf::new();
    b.put_u8(0xAB);
    b.put_u32(1);
    b.put_u64(u64::MAX);
    b.put_f64(-1.5);
    b.put_bool(false);
    assert!(b.valid());

    let mut r = RawBuf::new(b.data());
    assert_eq!(r.get_u8(), 0xAB);
    assert_eq!(r.get_u32(), 1);
    assert_eq!(r.get_u64(), u64::MAX);
    assert_eq!(r.get_f64(), -1.5);
    assert!(!r.get_bool());
    assert!(r.valid());
}

#[test]
fn test_string_encoding() {
    let mut b = Buf::new();
    b.put_str("hello");
    b.put_str("");
    b.put_str_null();
    assert!(b.valid());

    // u32 len + bytes + NUL for each, u32::MAX alone for null.
    assert_eq!(b.wpos(), (4 + 5 + 1) + (4 + 1) + 4);

    let mut r = RawBuf::new(b.data());
    assert_eq!(r.get_str(), "hello");
    assert_eq!(r.get_str(), "");
    assert_eq!(r.get_str(), "");
    assert!(r.valid());
    assert_eq!(r.remaining(), 0);
}

#[test]
fn test_blob_round_trip() {
    let payload = vec![7u8; 300];

    let mut b = Buf::new();
    b.put_blob(&payload);
    assert!(b.valid());

    let mut r = RawBuf::new(b.data());
    assert_eq!(r.get_blob(), &payload[..]);
    assert!(r.valid());
}

#[test]
fn test_read_underflow_is_sticky_and_returns_zero() {
    let mut r = RawBuf::new(&[1, 2, 3]);
    assert_eq!(r.get_u64(), 0);
    assert!(!r.valid());

    // Plenty of bytes remain for a u8, but the error is sticky.
    assert_eq!(r.get_u8(), 0);
    assert_eq!(r.get_str(), "");
    assert!(!r.valid());
}

#[test]
fn test_truncated_string_sets_error() {
    let mut b = Buf::new();
    b.put_str("hello world");

    let data = &b.data()[..b.wpos() - 3];
    let mut r = RawBuf::new(data);
    assert_eq!(r.get_str(), "");
    assert!(!r.valid());
}

#[test]
fn test_set_u32_at_patches_written_region() {
    let mut b = Buf::new();
    b.put_u32(0);
    b.put_u64(42);
    b.set_u32_at(0, 99);

    let mut r = RawBuf::new(b.data());
    assert_eq!(r.get_u32(), 99);
    assert_eq!(r.get_u64(), 42);
}

#[test]
fn test_set_u32_at_out_of_range_is_error() {
    let mut b = Buf::new();
    b.put_u8(1);
    b.set_u32_at(0, 5);
    assert!(!b.valid());
}

#[test]
fn test_peek_does_not_advance() {
    let mut b = Buf::new();
    b.put_u32(1234);

    let mut r = RawBuf::new(b.data());
    assert_eq!(r.peek_u32(), 1234);
    assert_eq!(r.peek_u32(), 1234);
    assert_eq!(r.get_u32(), 1234);
    assert_eq!(r.remaining(), 0);
}
