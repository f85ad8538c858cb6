//! Engine configuration

use serde::{Deserialize, Serialize};

/// Tunables for the reservation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds a reservation may stay open before the expiration
    /// sweep rolls it back.
    pub reservation_ttl_secs: i64,
    /// Number of quota computations a usage row participates in
    /// before a refresh is requested from the owning service.
    /// `0` disables the refresh protocol.
    pub until_refresh: u32,
    /// Bounded retries for storage transactions that fail with a
    /// serialization conflict.
    pub max_txn_retries: u32,
    /// Seconds between runs of the expiration sweeper task.
    pub sweep_interval_secs: u64,
}

impl EngineConfig {
    /// Reservation time-to-live as a chrono duration.
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_secs)
    }

    /// Sweep period as a std duration, for the tokio interval.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_ttl_secs: 3600,
            until_refresh: 25,
            max_txn_retries: 5,
            sweep_interval_secs: 60,
        }
    }
}
