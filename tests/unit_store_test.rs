use resql::core::log::Store;
use resql::core::log::entry;

#[test]
fn test_create_and_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(dir.path(), 0, 0).unwrap();

    assert_eq!(store.last_index, 0);

    for i in 0..100u64 {
        store
            .create_entry(1, i, 42, 0, format!("v{i}").as_bytes())
            .unwrap();
    }

    assert_eq!(store.last_index, 100);
    assert_eq!(store.last_term, 1);

    for i in 1..=100u64 {
        let e = store.entry_at(i).unwrap();
        assert_eq!(entry::seq(e), i - 1);
        assert_eq!(entry::cid(e), 42);
    }
    assert!(store.entry_at(101).is_none());
}

#[test]
fn test_restart_recovers_entries() {
    let dir = tempfile::tempdir().unwrap();

    {
        let mut store = Store::open(dir.path(), 0, 0).unwrap();
        for i in 0..50u64 {
            store.create_entry(2, i, 0, 0, b"payload").unwrap();
        }
        store.flush().unwrap();
    }

    let store = Store::open(dir.path(), 0, 0).unwrap();
    assert_eq!(store.last_index, 50);
    assert_eq!(store.last_term, 2);
    assert_eq!(store.term_of(25), 2);
}

#[test]
fn test_put_entry_replicated_bytes() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let mut leader = Store::open(dir_a.path(), 0, 0).unwrap();
    let mut follower = Store::open(dir_b.path(), 0, 0).unwrap();

    for i in 0..10u64 {
        leader.create_entry(3, i, 7, 1, b"replicate me").unwrap();
    }

    let (region, count) = leader.entries_from(1, u32::MAX).unwrap();
    assert_eq!(count, 10);
    let region = region.to_vec();

    let mut index = 1;
    for e in entry::iter(&region) {
        follower.put_entry(index, e).unwrap();
        index += 1;
    }

    assert_eq!(follower.last_index, 10);
    for i in 1..=10u64 {
        assert_eq!(leader.entry_at(i).unwrap(), follower.entry_at(i).unwrap());
    }
}

#[test]
fn test_remove_after_truncates_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(dir.path(), 0, 0).unwrap();

    for i in 0..20u64 {
        store.create_entry(1, i, 0, 0, b"x").unwrap();
    }

    store.remove_after(12).unwrap();
    assert_eq!(store.last_index, 12);
    assert!(store.entry_at(13).is_none());
    assert!(store.entry_at(12).is_some());

    // New entries take over the truncated range.
    store.create_entry(2, 0, 0, 0, b"y").unwrap();
    assert_eq!(store.last_index, 13);
    assert_eq!(entry::term(store.entry_at(13).unwrap()), 2);
}

#[test]
fn test_no_rotation_pending_on_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(dir.path(), 0, 0).unwrap();

    store.create_entry(1, 0, 0, 0, b"x").unwrap();
    assert_eq!(store.rotation_index(), u64::MAX);
}

#[test]
fn test_rotation_after_snapshot_taken() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = Store::open(dir.path(), 0, 0).unwrap();

    // Fill until the first page spills into the second.
    let blob = vec![0u8; 1024 * 1024];
    let mut last = 0u64;
    while store.rotation_index() == u64::MAX {
        store.create_entry(1, 0, 0, 0, &blob).unwrap();
        last += 1;
    }

    let boundary = store.rotation_index();
    assert!(boundary < last);

    store.snapshot_taken();
    assert_eq!(store.ss_index, boundary);
    assert_eq!(store.ss_term, 1);
    assert_eq!(store.rotation_index(), u64::MAX);

    // Entries after the boundary are still resolvable, ones before are not
    // required to be.
    let n = 5;
    for i in 0..n {
        store.create_entry(1, i, 0, 0, b"tail").unwrap();
    }
    assert_eq!(store.last_index, last + n);
    for i in boundary + 1..=store.last_index {
        assert!(store.entry_at(i).is_some(), "missing entry {i}");
    }

    // Below or at the boundary the term falls back to the snapshot term.
    assert_eq!(store.term_of(boundary), 1);
}

#[test]
fn test_open_with_snapshot_boundary_starts_there() {
    let dir = tempfile::tempdir().unwrap();

    let store = Store::open(dir.path(), 3, 500).unwrap();
    assert_eq!(store.last_index, 500);
    assert_eq!(store.last_term, 3);
    assert_eq!(store.term_of(500), 3);
}
