// End-to-end scenarios over in-process nodes and real sockets.

mod common;

use common::TestCluster;
use futures::{SinkExt, StreamExt};
use resql::client::Value;
use resql::core::buffer::Buf;
use resql::core::protocol::{Msg, MsgCodec, MsgRc, PROTOCOL, REMOTE_CLIENT, bind, flag, param};
use resql::server::AnyStream;
use std::time::Duration;
use tokio_util::codec::Framed;
use url::Url;

#[tokio::test]
async fn test_single_node_insert_select() {
    let base = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(base.path(), 24100, 1, 1).await;

    let mut c = cluster.client("app").await;

    c.put_sql("CREATE TABLE t (k INT, v TEXT);");
    c.put_sql("INSERT INTO t VALUES (1, 'a');");
    let rs = c.exec(false).await.unwrap();
    assert_eq!(rs.ops.len(), 2);
    assert_eq!(rs.ops[1].changes, 1);

    c.put_sql("SELECT * FROM t;");
    let rs = c.exec(true).await.unwrap();
    let op = rs.first();
    assert_eq!(op.columns, vec!["k", "v"]);
    assert_eq!(op.rows.len(), 1);
    assert_eq!(op.rows[0][0], Value::Integer(1));
    assert_eq!(op.rows[0][1], Value::Text("a".to_owned()));

    cluster.stop_all().await;
}

#[tokio::test]
async fn test_restart_recovery() {
    let base = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(base.path(), 24120, 1, 1).await;

    {
        let mut c = cluster.client("app").await;
        c.put_sql("CREATE TABLE t (k INT);");
        c.exec(false).await.unwrap();

        for chunk in 0..4 {
            for i in 0..25 {
                c.put_sql("INSERT INTO t VALUES (?);");
                c.bind_index(0, Value::Integer(chunk * 25 + i));
            }
            c.exec(false).await.unwrap();
        }
    }

    cluster.stop_all().await;
    cluster.start_node(0).await;

    let mut c = cluster.client("app2").await;
    c.put_sql("SELECT count(*) FROM t;");
    let rs = c.exec(true).await.unwrap();
    assert_eq!(rs.first().rows[0][0], Value::Integer(100));

    cluster.stop_all().await;
}

#[tokio::test]
async fn test_cluster_name_mismatch() {
    let base = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(base.path(), 24130, 1, 1).await;

    // Wait for the node to come up as leader.
    let c = cluster.client("probe").await;
    drop(c);

    let url = Url::parse(&common::node_url(24130, 0)).unwrap();
    let stream = AnyStream::connect(&url).await.unwrap();
    let mut framed = Framed::new(stream, MsgCodec);

    framed
        .send(Msg::ConnectReq {
            flags: REMOTE_CLIENT,
            protocol: PROTOCOL.to_owned(),
            cluster: "wrong-cluster".to_owned(),
            name: "app".to_owned(),
        })
        .await
        .unwrap();

    let resp = framed.next().await.unwrap().unwrap();
    match resp {
        Msg::ConnectResp { rc, .. } => assert_eq!(rc, MsgRc::ClusterNameMismatch),
        other => panic!("unexpected response: {other:?}"),
    }

    // The server closes the connection after the refusal.
    assert!(framed.next().await.is_none());

    cluster.stop_all().await;
}

#[tokio::test]
async fn test_prepared_dedup_and_replay() {
    let base = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(base.path(), 24110, 1, 1).await;

    {
        let mut setup = cluster.client("setup").await;
        setup.put_sql("CREATE TABLE t (k INT, v TEXT);");
        setup.exec(false).await.unwrap();
    }

    let url = Url::parse(&common::node_url(24110, 0)).unwrap();
    let stream = AnyStream::connect(&url).await.unwrap();
    let mut framed = Framed::new(stream, MsgCodec);

    framed
        .send(Msg::ConnectReq {
            flags: REMOTE_CLIENT,
            protocol: PROTOCOL.to_owned(),
            cluster: "test-cluster".to_owned(),
            name: "raw".to_owned(),
        })
        .await
        .unwrap();
    let resp = framed.next().await.unwrap().unwrap();
    assert!(matches!(resp, Msg::ConnectResp { rc: MsgRc::Ok, .. }));

    // Prepare INSERT INTO t VALUES(?, ?).
    let mut b = Buf::new();
    b.put_u8(flag::OP);
    b.put_u8(flag::STMT_PREPARE);
    b.put_str("INSERT INTO t VALUES (?, ?);");
    b.put_u8(flag::OP_END);
    b.put_u8(flag::MSG_END);

    framed
        .send(Msg::ClientReq {
            readonly: false,
            seq: 1,
            batch: b.into_vec().into(),
        })
        .await
        .unwrap();
    let resp = framed.next().await.unwrap().unwrap();
    let Msg::ClientResp { batch } = resp else {
        panic!("expected client resp");
    };
    assert_eq!(batch[0], flag::OK);
    // OK | OP | len(4) | id(8) ...
    let stmt_id = u64::from_le_bytes(batch[6..14].try_into().unwrap());
    assert!(stmt_id > 0);

    // Execute it with (0, 'jane').
    let mut b = Buf::new();
    b.put_u8(flag::OP);
    b.put_u8(flag::STMT_ID);
    b.put_u64(stmt_id);
    b.put_u8(bind::INDEX);
    b.put_u32(0);
    b.put_u8(param::INTEGER);
    b.put_u64(0);
    b.put_u8(bind::INDEX);
    b.put_u32(1);
    b.put_u8(param::TEXT);
    b.put_str("jane");
    b.put_u8(bind::END);
    b.put_u8(flag::OP_END);
    b.put_u8(flag::MSG_END);
    let req = Msg::ClientReq {
        readonly: false,
        seq: 2,
        batch: b.into_vec().into(),
    };

    framed.send(req.clone()).await.unwrap();
    let Msg::ClientResp { batch: first } = framed.next().await.unwrap().unwrap() else {
        panic!("expected client resp");
    };
    assert_eq!(first[0], flag::OK);
    let changes = u32::from_le_bytes(first[6..10].try_into().unwrap());
    let rowid = u64::from_le_bytes(first[10..18].try_into().unwrap());
    assert_eq!(changes, 1);
    assert_eq!(rowid, 1);

    // Resend the exact same request bytes: same sequence, cached response,
    // no second execution.
    framed.send(req).await.unwrap();
    let Msg::ClientResp { batch: second } = framed.next().await.unwrap().unwrap() else {
        panic!("expected client resp");
    };
    assert_eq!(first, second);

    let mut check = cluster.client("check").await;
    check.put_sql("SELECT count(*) FROM t;");
    let rs = check.exec(true).await.unwrap();
    assert_eq!(rs.first().rows[0][0], Value::Integer(1));

    cluster.stop_all().await;
}

#[tokio::test]
async fn test_three_node_failover() {
    let base = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(base.path(), 24140, 3, 3).await;

    let mut c = cluster.client("app").await;

    c.put_sql("CREATE TABLE t (k INT, v TEXT);");
    c.exec(false).await.unwrap();

    let stmt = c.prepare("INSERT INTO t VALUES (?, ?);").await.unwrap();
    for chunk in 0..20i64 {
        for i in 0..100i64 {
            c.put_prepared(stmt);
            c.bind_index(0, Value::Integer(chunk * 100 + i));
            c.bind_index(1, Value::Text("value".to_owned()));
        }
        c.exec(false).await.unwrap();
    }

    let leader = c.leader_name().expect("leader known");
    cluster.kill(&leader);

    // The client reconnects to the new leader and retries.
    c.put_sql("SELECT count(*) FROM t;");
    let rs = c.exec(true).await.unwrap();
    assert_eq!(rs.first().rows[0][0], Value::Integer(2000));

    c.put_sql("SELECT k FROM t ORDER BY k;");
    let rs = c.exec(true).await.unwrap();
    assert_eq!(rs.first().rows.len(), 2000);
    for (i, row) in rs.first().rows.iter().enumerate() {
        assert_eq!(row[0], Value::Integer(i as i64));
    }

    cluster.stop_all().await;
}

#[tokio::test]
async fn test_random_determinism_across_failover() {
    let base = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(base.path(), 24150, 3, 3).await;

    let mut c = cluster.client("app").await;

    c.put_sql("CREATE TABLE test (a INT, b FLOAT, c BLOB);");
    // The write path runs random() through the replicated generator, so
    // every replica stores the same values.
    c.put_sql("INSERT INTO test VALUES (random(), random(), randomblob(64));");
    c.exec(false).await.unwrap();

    c.put_sql("SELECT * FROM test;");
    let before = c.exec(true).await.unwrap();
    let row_before = before.first().rows[0].clone();
    assert!(matches!(row_before[2], Value::Blob(ref b) if b.len() == 64));

    let leader = c.leader_name().expect("leader known");
    cluster.kill(&leader);

    c.put_sql("SELECT * FROM test;");
    let after = c.exec(true).await.unwrap();
    assert_eq!(after.first().rows[0], row_before);

    cluster.stop_all().await;
}

#[tokio::test]
async fn test_snapshot_transfer_to_empty_node() {
    let base = tempfile::tempdir().unwrap();
    // Three-node cluster, only two started: majority holds at two.
    let mut cluster = TestCluster::start(base.path(), 24160, 3, 2).await;

    let mut c = cluster.client("loader").await;
    c.put_sql("CREATE TABLE big (k INT, v TEXT);");
    c.exec(false).await.unwrap();

    // Enough data to fill both log pages, forcing a rotation into the
    // snapshot; entries below the boundary disappear from disk.
    let filler = "x".repeat(1000);
    let stmt = c.prepare("INSERT INTO big VALUES (?, ?);").await.unwrap();
    let total: i64 = 72_000;
    let batch: i64 = 500;
    for chunk in 0..(total / batch) {
        for i in 0..batch {
            c.put_prepared(stmt);
            c.bind_index(0, Value::Integer(chunk * batch + i));
            c.bind_index(1, Value::Text(filler.clone()));
        }
        c.exec(false).await.unwrap();
    }

    // A fresh node joins and must catch up through a snapshot install.
    cluster.start_node(2).await;

    let ss_path = cluster.node_dir(2).join("snapshot.resql");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    loop {
        let size = std::fs::metadata(&ss_path).map(|m| m.len()).unwrap_or(0);
        if size > 10 * 1024 * 1024 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "snapshot never arrived on the new node"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // The old leader goes away; the survivors must hold all the data.
    let leader = c.leader_name().expect("leader known");
    cluster.kill(&leader);

    c.put_sql("SELECT count(*) FROM big;");
    let rs = c.exec(true).await.unwrap();
    assert_eq!(rs.first().rows[0][0], Value::Integer(total));

    c.put_sql("SELECT k FROM big ORDER BY k LIMIT 100;");
    let rs = c.exec(true).await.unwrap();
    for (i, row) in rs.first().rows.iter().enumerate() {
        assert_eq!(row[0], Value::Integer(i as i64));
    }

    cluster.stop_all().await;
}
