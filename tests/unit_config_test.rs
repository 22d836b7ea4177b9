use resql::config::Config;
use std::io::Write;

#[test]
fn test_defaults() {
    let c = Config::default();
    assert_eq!(c.node.name, "node0");
    assert_eq!(c.node.log_level, "INFO");
    assert_eq!(c.node.log_destination, "stdout");
    assert!(!c.node.in_memory);
    assert_eq!(c.advanced.heartbeat, 1000);
    assert!(c.advanced.fsync);
    assert_eq!(c.advanced.session_timeout, 60_000);
    assert!(c.validate().is_ok());
}

#[test]
fn test_ini_file_parsing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resql.ini");

    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(
        f,
        "[node]\n\
         name = node3\n\
         bind-url = tcp://node3@127.0.0.1:9000\n\
         advertise-url = tcp://node3@10.0.0.3:9000\n\
         log-level = DEBUG\n\
         directory = /tmp/n3\n\
         in-memory = true\n\
         \n\
         [cluster]\n\
         name = prod\n\
         nodes = tcp://node3@10.0.0.3:9000 tcp://node4@10.0.0.4:9000\n\
         \n\
         [advanced]\n\
         heartbeat = 500\n\
         fsync = false\n\
         session-timeout = 30000"
    )
    .unwrap();

    let c = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(c.node.name, "node3");
    assert_eq!(c.node.bind_url, "tcp://node3@127.0.0.1:9000");
    assert_eq!(c.node.advertise_url, "tcp://node3@10.0.0.3:9000");
    assert_eq!(c.node.log_level, "DEBUG");
    assert_eq!(c.node.directory, "/tmp/n3");
    assert!(c.node.in_memory);
    assert_eq!(c.cluster.name, "prod");
    assert!(c.cluster.nodes.contains("node4"));
    assert_eq!(c.advanced.heartbeat, 500);
    assert!(!c.advanced.fsync);
    assert_eq!(c.advanced.session_timeout, 30_000);
}

#[test]
fn test_cmdline_overrides() {
    let mut c = Config::default();

    c.apply_cmdline("node-name", "node9").unwrap();
    c.apply_cmdline("node-directory", "/tmp/n9").unwrap();
    c.apply_cmdline("cluster-name", "staging").unwrap();
    c.apply_cmdline("advanced-heartbeat", "250").unwrap();
    c.apply_cmdline("advanced-fsync", "false").unwrap();
    c.apply_cmdline("node-in-memory", "true").unwrap();

    assert_eq!(c.node.name, "node9");
    assert_eq!(c.node.directory, "/tmp/n9");
    assert_eq!(c.cluster.name, "staging");
    assert_eq!(c.advanced.heartbeat, 250);
    assert!(!c.advanced.fsync);
    assert!(c.node.in_memory);
}

#[test]
fn test_cmdline_rejects_unknown_and_bad_values() {
    let mut c = Config::default();
    assert!(c.apply_cmdline("node-nope", "x").is_err());
    assert!(c.apply_cmdline("advanced-heartbeat", "soon").is_err());
    assert!(c.apply_cmdline("node-in-memory", "kinda").is_err());
}

#[test]
fn test_validation() {
    let mut c = Config::default();

    c.node.log_level = "CHATTY".to_owned();
    assert!(c.validate().is_err());
    c.node.log_level = "WARN".to_owned();
    assert!(c.validate().is_ok());

    c.node.log_destination = "syslog".to_owned();
    assert!(c.validate().is_err());
    c.node.log_destination = "file".to_owned();
    assert!(c.validate().is_ok());

    c.advanced.heartbeat = 10;
    assert!(c.validate().is_err());
}
