// Shared helpers for the in-process cluster tests.

use resql::client::{Client, ClientConfig};
use resql::config::Config;
use resql::server::{self, ServerHandle};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub struct TestCluster {
    pub handles: HashMap<String, ServerHandle>,
    pub urls: Vec<String>,
    pub cluster_name: String,
    base: std::path::PathBuf,
    base_port: u16,
    size: usize,
}

pub fn node_url(base_port: u16, i: usize) -> String {
    format!("tcp://node{i}@127.0.0.1:{}", base_port + i as u16)
}

pub fn node_config(base: &Path, base_port: u16, i: usize, size: usize) -> Config {
    let urls: Vec<String> = (0..size).map(|j| node_url(base_port, j)).collect();

    let mut c = Config::default();
    c.node.name = format!("node{i}");
    c.node.bind_url = node_url(base_port, i);
    c.node.advertise_url = node_url(base_port, i);
    c.node.directory = base.join(format!("node{i}")).display().to_string();
    c.cluster.name = "test-cluster".to_owned();
    c.cluster.nodes = urls.join(" ");
    c.advanced.heartbeat = 200;
    c.advanced.fsync = false;
    c
}

impl TestCluster {
    /// Starts the first `started` nodes of a `size`-node cluster.
    pub async fn start(base: &Path, base_port: u16, size: usize, started: usize) -> TestCluster {
        let mut handles = HashMap::new();

        for i in 0..started {
            let conf = node_config(base, base_port, i, size);
            let handle = server::spawn(conf).await.expect("spawn node");
            handles.insert(format!("node{i}"), handle);
        }

        TestCluster {
            handles,
            urls: (0..size).map(|j| node_url(base_port, j)).collect(),
            cluster_name: "test-cluster".to_owned(),
            base: base.to_path_buf(),
            base_port,
            size,
        }
    }

    /// Starts (or restarts) one node.
    pub async fn start_node(&mut self, i: usize) {
        let conf = node_config(&self.base, self.base_port, i, self.size);
        let handle = server::spawn(conf).await.expect("spawn node");
        self.handles.insert(format!("node{i}"), handle);
    }

    /// Hard-kills one node, as a crash would.
    pub fn kill(&mut self, name: &str) {
        if let Some(handle) = self.handles.remove(name) {
            handle.kill();
        }
    }

    pub async fn stop_all(&mut self) {
        let names: Vec<String> = self.handles.keys().cloned().collect();
        for name in names {
            if let Some(handle) = self.handles.remove(&name) {
                handle.stop();
                let _ = handle.join().await;
            }
        }
        // Give sockets a moment to release.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    pub async fn client(&self, name: &str) -> Client {
        Client::connect(ClientConfig {
            cluster_name: self.cluster_name.clone(),
            client_name: name.to_owned(),
            urls: self.urls.clone(),
            timeout: Duration::from_secs(30),
        })
        .await
        .expect("client connect")
    }

    pub fn node_dir(&self, i: usize) -> std::path::PathBuf {
        self.base.join(format!("node{i}"))
    }
}
