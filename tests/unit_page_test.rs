use resql::core::log::Page;
use resql::core::log::entry;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

#[test]
fn test_fresh_page_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let page = Page::open(&dir.path().join("page.0.resql"), None, 100).unwrap();

    assert!(page.is_empty());
    assert_eq!(page.prev_index, 100);
    assert_eq!(page.last_index(), 100);
}

#[test]
fn test_append_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.0.resql");

    {
        let mut page = Page::open(&path, None, 0).unwrap();
        for i in 0..10u64 {
            page.create_entry(1, i, 0, 0, format!("data-{i}").as_bytes());
        }
        page.flush(10).unwrap();
        assert_eq!(page.last_index(), 10);
    }

    let page = Page::open(&path, None, 0).unwrap();
    assert_eq!(page.entry_count(), 10);
    assert_eq!(page.prev_index, 0);

    for i in 1..=10u64 {
        let e = page.entry_at(i).unwrap();
        assert_eq!(entry::data(e), format!("data-{}", i - 1).as_bytes());
    }
    assert!(page.entry_at(0).is_none());
    assert!(page.entry_at(11).is_none());
}

#[test]
fn test_truncated_tail_recovers_to_last_full_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.0.resql");

    {
        let mut page = Page::open(&path, None, 0).unwrap();
        for i in 0..5u64 {
            page.create_entry(1, i, 0, 0, b"0123456789abcdef");
        }
        page.flush(5).unwrap();
    }

    // Corrupt the middle of the last entry, as a torn write would.
    {
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        // Entries are fixed-size here; the fifth starts at header + 4 blocks.
        let entry_size = entry::encoded_len(16) as u64;
        let fifth_start = 32 + 4 * entry_size;
        f.seek(SeekFrom::Start(fifth_start + 40)).unwrap();
        f.write_all(&[0xFF; 4]).unwrap();
    }

    let page = Page::open(&path, None, 0).unwrap();
    assert_eq!(page.entry_count(), 4);
    assert_eq!(page.last_index(), 4);
    assert!(page.entry_at(5).is_none());
}

#[test]
fn test_corrupt_header_reinitializes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.0.resql");

    {
        let mut page = Page::open(&path, None, 0).unwrap();
        page.create_entry(1, 0, 0, 0, b"x");
        page.flush(1).unwrap();
    }

    {
        let mut f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        f.seek(SeekFrom::Start(8)).unwrap();
        f.write_all(&[0xAA; 8]).unwrap();
    }

    let page = Page::open(&path, None, 42).unwrap();
    assert!(page.is_empty());
    assert_eq!(page.prev_index, 42);
}

#[test]
fn test_remove_after_rewinds_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.0.resql");

    {
        let mut page = Page::open(&path, None, 0).unwrap();
        for i in 0..8u64 {
            page.create_entry(1, i, 0, 0, b"abc");
        }
        page.remove_after(3).unwrap();
        assert_eq!(page.last_index(), 3);
        assert!(page.entry_at(4).is_none());

        // Appends continue from the truncation point.
        page.create_entry(2, 0, 0, 0, b"new");
        assert_eq!(page.last_index(), 4);
        page.flush(4).unwrap();
    }

    let page = Page::open(&path, None, 0).unwrap();
    assert_eq!(page.entry_count(), 4);
    assert_eq!(entry::data(page.entry_at(4).unwrap()), b"new");
    assert_eq!(entry::term(page.entry_at(4).unwrap()), 2);
}

#[test]
fn test_remove_after_prev_index_clears() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.0.resql");

    let mut page = Page::open(&path, None, 5).unwrap();
    page.create_entry(1, 0, 0, 0, b"a");
    page.remove_after(5).unwrap();

    assert!(page.is_empty());
    assert_eq!(page.prev_index, 5);
}

#[test]
fn test_entries_from_respects_byte_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut page = Page::open(&dir.path().join("p"), None, 0).unwrap();

    for i in 0..10u64 {
        page.create_entry(1, i, 0, 0, &[0u8; 100]);
    }

    let one = entry::encoded_len(100) as u32;

    let (region, count) = page.entries_from(1, one).unwrap();
    assert_eq!(count, 1);
    assert_eq!(region.len() as u32, one);

    let (region, count) = page.entries_from(1, 3 * one).unwrap();
    assert_eq!(count, 3);
    assert_eq!(region.len() as u32, 3 * one);

    // Asking past the end returns everything left.
    let (_, count) = page.entries_from(8, u32::MAX).unwrap();
    assert_eq!(count, 3);

    assert!(page.entries_from(11, one).is_none());
}

#[test]
fn test_reopen_keeps_larger_file_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("p");

    {
        let _ = Page::open(&path, None, 0).unwrap();
    }

    let len = std::fs::metadata(&path).unwrap().len();
    let mut f = OpenOptions::new().read(true).open(&path).unwrap();
    let mut head = [0u8; 4];
    f.read_exact(&mut head).unwrap();

    // 32 MiB initial size, version 1 header.
    assert_eq!(len, 32 * 1024 * 1024);
    assert_eq!(u32::from_le_bytes(head), 1);
}
