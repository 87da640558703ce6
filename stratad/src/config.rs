use serde::{Deserialize, Serialize};
use std::path::Path;
use strata_cluster::ClusterConfig;
use strata_core::{Result, StrataError, DEFAULT_REQUEST_TIMEOUT_MS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier within the cluster
    pub node_id: u32,
    /// Port for peer connections
    pub listen_port: u16,
    /// Hostname announced to peers
    pub advertise_host: String,
    /// Full cluster roster as host:port:id, this node included
    pub peer_servers: Vec<String>,
    /// Workers draining the inbound packet queue
    pub worker_count: usize,
    /// Inbound packet queue capacity
    pub inbound_queue: usize,
    /// Reconnect attempts per peer before giving up (-1 = unlimited)
    pub reconnect_retry_limit: i32,
    /// Default timeout for synchronous requests in milliseconds
    pub request_timeout_ms: u64,
    /// Log filter applied when RUST_LOG is unset
    pub log_filter: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_port: 8001,
            advertise_host: "localhost".to_string(),
            peer_servers: Vec::new(),
            worker_count: 4,
            inbound_queue: 256,
            reconnect_retry_limit: -1,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            log_filter: "info,strata=debug".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| StrataError::Config(format!("TOML parse error: {}", e)))
    }

    pub fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_id: self.node_id,
            listen_port: self.listen_port,
            advertise_host: self.advertise_host.clone(),
            peer_servers: self.peer_servers.clone(),
            worker_count: self.worker_count,
            inbound_queue: self.inbound_queue,
            retry_limit: self.reconnect_retry_limit,
            default_timeout_ms: self.request_timeout_ms,
        }
    }
}
