// src/config.rs

//! Server configuration: an INI file plus command-line mirrors of every key
//! (`--node-name=`, `--advanced-heartbeat=`, ...).

use crate::core::errors::{ResqlError, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    #[serde(rename = "bind-url")]
    pub bind_url: String,
    #[serde(rename = "advertise-url")]
    pub advertise_url: String,
    #[serde(rename = "source-addr")]
    pub source_addr: String,
    #[serde(rename = "source-port")]
    pub source_port: String,
    #[serde(rename = "log-level")]
    pub log_level: String,
    #[serde(rename = "log-destination")]
    pub log_destination: String,
    pub directory: String,
    #[serde(rename = "in-memory")]
    pub in_memory: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            name: "node0".to_owned(),
            bind_url: "tcp://node0@127.0.0.1:7600".to_owned(),
            advertise_url: "tcp://node0@127.0.0.1:7600".to_owned(),
            source_addr: String::new(),
            source_port: String::new(),
            log_level: "INFO".to_owned(),
            log_destination: "stdout".to_owned(),
            directory: ".".to_owned(),
            in_memory: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub name: String,
    /// Space-separated node URL list.
    pub nodes: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            name: "cluster".to_owned(),
            nodes: "tcp://node0@127.0.0.1:7600".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    /// Heartbeat period, milliseconds. Election timeouts derive from it.
    pub heartbeat: u64,
    /// msync the log on the durability path.
    pub fsync: bool,
    /// How long a disconnected session survives, milliseconds.
    #[serde(rename = "session-timeout")]
    pub session_timeout: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        AdvancedConfig {
            heartbeat: 1000,
            fsync: true,
            session_timeout: 60_000,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Config> {
        let built = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Ini))
            .build()
            .map_err(|e| ResqlError::Config(format!("{path}: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| ResqlError::Config(format!("{path}: {e}")))
    }

    /// Applies one `section-key=value` command-line override.
    pub fn apply_cmdline(&mut self, key: &str, value: &str) -> Result<()> {
        let bad =
            |k: &str| ResqlError::Config(format!("unknown or invalid option: --{k}={value}"));

        match key {
            "node-name" => self.node.name = value.to_owned(),
            "node-bind-url" => self.node.bind_url = value.to_owned(),
            "node-advertise-url" => self.node.advertise_url = value.to_owned(),
            "node-source-addr" => self.node.source_addr = value.to_owned(),
            "node-source-port" => self.node.source_port = value.to_owned(),
            "node-log-level" => self.node.log_level = value.to_owned(),
            "node-log-destination" => self.node.log_destination = value.to_owned(),
            "node-directory" => self.node.directory = value.to_owned(),
            "node-in-memory" => {
                self.node.in_memory = value.parse().map_err(|_| bad(key))?;
            }
            "cluster-name" => self.cluster.name = value.to_owned(),
            "cluster-nodes" => self.cluster.nodes = value.to_owned(),
            "advanced-heartbeat" => {
                self.advanced.heartbeat = value.parse().map_err(|_| bad(key))?;
            }
            "advanced-fsync" => {
                self.advanced.fsync = value.parse().map_err(|_| bad(key))?;
            }
            "advanced-session-timeout" => {
                self.advanced.session_timeout = value.parse().map_err(|_| bad(key))?;
            }
            _ => return Err(bad(key)),
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.name.is_empty() {
            return Err(ResqlError::Config("node name cannot be empty".to_owned()));
        }
        if self.cluster.name.is_empty() {
            return Err(ResqlError::Config("cluster name cannot be empty".to_owned()));
        }
        if !matches!(
            self.node.log_level.to_uppercase().as_str(),
            "DEBUG" | "INFO" | "WARN" | "ERROR"
        ) {
            return Err(ResqlError::Config(format!(
                "invalid log-level: {}",
                self.node.log_level
            )));
        }
        if !matches!(self.node.log_destination.as_str(), "stdout" | "file") {
            return Err(ResqlError::Config(format!(
                "invalid log-destination: {}",
                self.node.log_destination
            )));
        }
        if self.advanced.heartbeat < 100 {
            return Err(ResqlError::Config(
                "heartbeat must be at least 100 ms".to_owned(),
            ));
        }
        Ok(())
    }
}
