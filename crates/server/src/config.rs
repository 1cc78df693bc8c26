use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub bind: String,
    pub port: u16,
    pub password: String,
    pub tick_rate: u32,
    pub max_clients: usize,
    pub conn_timeout_secs: u64,
    /// Snapshot every tick instead of every other one.
    pub high_bandwidth: bool,
    /// Byte budget for one tick's snapshot; overruns skip objects, they
    /// never fail the tick.
    pub snapshot_budget: usize,
    pub snap_id_capacity: usize,
    /// Quarantine for freed snapshot ids. Keep the default unless every
    /// client and recorded demo moves with you.
    pub snap_id_reuse_delay_secs: u64,
    /// Connless server-info responses allowed per second.
    pub info_replies_per_second: u32,
    pub demo_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "unnamed server".to_string(),
            bind: "0.0.0.0".to_string(),
            port: 8303,
            password: String::new(),
            tick_rate: 50,
            max_clients: 16,
            conn_timeout_secs: 10,
            high_bandwidth: false,
            snapshot_budget: ricochet::MAX_SNAPSHOT_SIZE,
            snap_id_capacity: ricochet::snapshot::DEFAULT_ID_CAPACITY,
            snap_id_reuse_delay_secs: 5,
            info_replies_per_second: 10,
            demo_path: None,
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
