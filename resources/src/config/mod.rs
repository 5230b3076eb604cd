use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    /// API server URL
    pub api_server_url: String,
    /// API server watch URL
    pub api_server_watch_url: String,
    /// Metrics server URL, defaults to the API server
    pub metrics_server_url: String,
    /// Number of parallel reconcile workers
    pub workers: usize,
    /// Period after which a reconciled autoscaler is requeued
    pub resync_period_seconds: u64,
    /// Trailing window over which the highest recommendation
    /// is used when scaling down without an explicit behavior
    pub downscale_stabilisation_seconds: u64,
    /// Usage ratios within this distance of 1.0 keep the current replica count
    pub tolerance: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            api_server_url: "http://localhost:8080".to_string(),
            api_server_watch_url: "ws://localhost:8080".to_string(),
            metrics_server_url: "http://localhost:8080".to_string(),
            workers: 4,
            resync_period_seconds: 15,
            downscale_stabilisation_seconds: 300,
            tolerance: 0.1,
        }
    }
}
