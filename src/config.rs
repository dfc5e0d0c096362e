use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration for a broker instance.
///
/// All channel capacities are in messages. `node_id` is `0` for a standalone
/// broker; non-zero values are reserved for cluster operation, where the
/// originating node is recorded in every stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base directory for the partitioned message store
    pub store_dir: PathBuf,
    /// Cluster node identifier (`0` = standalone)
    pub node_id: u8,
    /// Capacity of the router's internal handle channel
    pub handle_channel_size: usize,
    /// Seconds between health-check rounds
    pub health_frequency_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("data/store"),
            node_id: 0,
            handle_channel_size: 500,
            health_frequency_secs: 60,
        }
    }
}
