pub mod settings;

use serde::{Deserialize, Serialize};

/// AMQP mandates that peers accept frames of at least this size before
/// tuning completes.
pub const FRAME_MIN_SIZE: u32 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    /// Upper bound offered in `Connection.Tune`.
    pub channel_max: u16,
    /// Largest frame payload offered in `Connection.Tune`.
    pub frame_max: u32,
    /// Heartbeat interval in seconds offered in `Connection.Tune`; zero
    /// disables heartbeats.
    pub heartbeat: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5672,
            data_dir: "./data".to_string(),
            channel_max: 2047,
            frame_max: 131072,
            heartbeat: 60,
        }
    }
}

impl BrokerConfig {
    /// Validate configuration bounds before the broker starts.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.channel_max == 0 {
            return Err("channel_max must be > 0".to_string());
        }
        if self.frame_max < FRAME_MIN_SIZE {
            return Err(format!("frame_max must be >= {}", FRAME_MIN_SIZE));
        }
        if self.data_dir.is_empty() {
            return Err("data_dir must not be empty".to_string());
        }
        Ok(())
    }
}
