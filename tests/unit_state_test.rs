use resql::core::buffer::Buf;
use resql::core::cmd;
use resql::core::log::entry;
use resql::core::protocol::{bind, flag};
use resql::core::state::State;
use std::path::Path;

fn make_entry(term: u64, seq: u64, cid: u64, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Buf::new();
    entry::encode(&mut buf, term, seq, cid, flags, payload);
    buf.into_vec()
}

fn init_entry(term: u64) -> Vec<u8> {
    let mut buf = Buf::new();
    cmd::encode_init(&mut buf, 1_600_000_000_000, 1000, &[9u8; cmd::INIT_RAND_LEN]);
    make_entry(term, 0, 0, cmd::CMD_INIT, buf.data())
}

fn connect_entry(term: u64, name: &str) -> Vec<u8> {
    let mut buf = Buf::new();
    cmd::encode_connect(&mut buf, name, "local", "remote");
    make_entry(term, 0, 0, cmd::CMD_CONNECT, buf.data())
}

fn sql_batch(sql: &str) -> Vec<u8> {
    let mut b = Buf::new();
    b.put_u8(flag::OP);
    b.put_u8(flag::STMT);
    b.put_str(sql);
    b.put_u8(bind::END);
    b.put_u8(flag::OP_END);
    b.put_u8(flag::MSG_END);
    b.into_vec()
}

fn request_entry(term: u64, seq: u64, cid: u64, sql: &str) -> Vec<u8> {
    make_entry(term, seq, cid, cmd::CMD_REQUEST, &sql_batch(sql))
}

/// Builds a fresh state and applies the standard prologue: INIT at 1,
/// CONNECT for `client` at 2. Returns the session id.
fn bootstrap(state: &mut State, client: &str) -> u64 {
    state.open(false).unwrap();
    state.apply(1, &init_entry(1)).unwrap();
    let applied = state.apply(2, &connect_entry(1, client)).unwrap().unwrap();
    applied.id
}

fn apply_script(dir: &Path) -> Vec<u8> {
    let mut state = State::new(dir, "cluster", 60_000);
    let cid = bootstrap(&mut state, "c1");

    state
        .apply(3, &request_entry(1, 1, cid, "CREATE TABLE t (k INT, v TEXT);"))
        .unwrap();
    state
        .apply(
            4,
            &request_entry(1, 2, cid, "INSERT INTO t VALUES (1, 'a'), (random(), 'b');"),
        )
        .unwrap();

    let resp = state
        .apply_readonly(cid, &sql_batch("SELECT k, v FROM t ORDER BY v;"))
        .unwrap();
    state.close().unwrap();
    resp
}

#[test]
fn test_apply_executes_sql_and_responds() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = State::new(dir.path(), "cluster", 60_000);
    let cid = bootstrap(&mut state, "c1");

    let applied = state
        .apply(3, &request_entry(1, 1, cid, "CREATE TABLE t (k INT, v TEXT);"))
        .unwrap()
        .unwrap();
    assert_eq!(applied.resp[0], flag::OK);
    assert_eq!(applied.seq, 1);

    let applied = state
        .apply(
            4,
            &request_entry(1, 2, cid, "INSERT INTO t VALUES (7, 'seven');"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(applied.resp[0], flag::OK);

    let resp = state
        .apply_readonly(cid, &sql_batch("SELECT count(*) FROM t;"))
        .unwrap();
    assert_eq!(resp[0], flag::OK);
}

#[test]
fn test_duplicate_seq_returns_cached_response() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = State::new(dir.path(), "cluster", 60_000);
    let cid = bootstrap(&mut state, "c1");

    state
        .apply(3, &request_entry(1, 1, cid, "CREATE TABLE t (k INT);"))
        .unwrap();
    let first = state
        .apply(4, &request_entry(1, 2, cid, "INSERT INTO t VALUES (1);"))
        .unwrap()
        .unwrap();

    // The same sequence number applies again (a reconnect retry): the
    // cached bytes come back and nothing re-executes.
    let second = state
        .apply(5, &request_entry(1, 2, cid, "INSERT INTO t VALUES (1);"))
        .unwrap()
        .unwrap();
    assert_eq!(first.resp, second.resp);

    let resp = state
        .apply_readonly(cid, &sql_batch("SELECT count(*) FROM t;"))
        .unwrap();
    // One row block, count column == 1.
    let count_pos = resp.len() - 10;
    let count = u64::from_le_bytes(resp[count_pos..count_pos + 8].try_into().unwrap());
    assert_eq!(count, 1);
}

#[test]
fn test_sql_error_rolls_back_batch() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = State::new(dir.path(), "cluster", 60_000);
    let cid = bootstrap(&mut state, "c1");

    state
        .apply(3, &request_entry(1, 1, cid, "CREATE TABLE t (k INT);"))
        .unwrap();

    // Second statement in the batch fails: the whole request rolls back.
    let mut b = Buf::new();
    for sql in ["INSERT INTO t VALUES (1);", "INSERT INTO nosuch VALUES (1);"] {
        b.put_u8(flag::OP);
        b.put_u8(flag::STMT);
        b.put_str(sql);
        b.put_u8(bind::END);
        b.put_u8(flag::OP_END);
    }
    b.put_u8(flag::MSG_END);
    let e = make_entry(1, 2, cid, cmd::CMD_REQUEST, b.data());

    let applied = state.apply(4, &e).unwrap().unwrap();
    assert_eq!(applied.resp[0], flag::ERROR);

    let resp = state
        .apply_readonly(cid, &sql_batch("SELECT count(*) FROM t;"))
        .unwrap();
    let count_pos = resp.len() - 10;
    let count = u64::from_le_bytes(resp[count_pos..count_pos + 8].try_into().unwrap());
    assert_eq!(count, 0);
}

#[test]
fn test_denylist_blocks_internal_tables() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = State::new(dir.path(), "cluster", 60_000);
    let cid = bootstrap(&mut state, "c1");

    let applied = state
        .apply(
            3,
            &request_entry(1, 1, cid, "DELETE FROM resql_clients;"),
        )
        .unwrap()
        .unwrap();
    assert_eq!(applied.resp[0], flag::ERROR);
}

#[test]
fn test_sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    let cid = {
        let mut state = State::new(dir.path(), "cluster", 60_000);
        let cid = bootstrap(&mut state, "c1");
        state
            .apply(3, &request_entry(1, 1, cid, "CREATE TABLE t (k INT);"))
            .unwrap();
        state.close().unwrap();
        cid
    };

    let mut state = State::new(dir.path(), "cluster", 60_000);
    state.open(false).unwrap();
    assert_eq!(state.index, 3);
    assert_eq!(state.session_seq("c1"), Some(1));

    // The session keeps its identity on reconnect.
    let applied = state.apply(4, &connect_entry(1, "c1")).unwrap().unwrap();
    assert_eq!(applied.id, cid);
    assert_eq!(applied.seq, 1);
}

#[test]
fn test_identical_entries_produce_identical_state() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let resp_a = apply_script(dir_a.path());
    let resp_b = apply_script(dir_b.path());

    // Responses, including the value of random(), match byte for byte.
    assert_eq!(resp_a, resp_b);

    let state_a = std::fs::read(dir_a.path().join("state.resql")).unwrap();
    let state_b = std::fs::read(dir_b.path().join("state.resql")).unwrap();
    assert_eq!(state_a, state_b);
}

#[test]
fn test_term_start_soft_disconnects_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut state = State::new(dir.path(), "cluster", 60_000);
    let cid = bootstrap(&mut state, "c1");

    let mut buf = Buf::new();
    cmd::encode_clock(&mut buf, 1_600_000_001_000, 2000);
    let e = make_entry(2, 0, 0, cmd::CMD_TERM, buf.data());
    state.apply(3, &e).unwrap();

    // Session still resolvable; a new CONNECT resumes it with its sequence.
    assert_eq!(state.session_seq("c1"), Some(0));
    let applied = state.apply(4, &connect_entry(2, "c1")).unwrap().unwrap();
    assert_eq!(applied.id, cid);
}
