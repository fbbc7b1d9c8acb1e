//! Engine and runtime configuration.

use serde::{Deserialize, Serialize};

/// How an append is made durable before it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fdatasync`: file data plus the metadata needed to read it back.
    #[default]
    Data,
    /// `fsync`: file data and all metadata.
    Full,
}

/// Storage engine options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sync call issued after every frame write.
    pub sync_mode: SyncMode,
    /// Largest accepted payload in bytes.
    pub max_payload_bytes: u32,
    /// Resolve timestamp bounds by linear scan once clock skew has been seen.
    pub exact_timestamps: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Data,
            max_payload_bytes: u32::MAX,
            exact_timestamps: false,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON config document; absent fields keep their defaults.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Options for the async single-writer runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the writer command queue.
    pub command_queue_bound: usize,
    /// Capacity of the broadcast channel for [`crate::runtime::events::EngineEvent`].
    pub event_channel_capacity: usize,
    /// Write table checkpoints after this many appends; `0` disables.
    pub checkpoint_every_appends: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command_queue_bound: 256,
            event_channel_capacity: 1024,
            checkpoint_every_appends: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg = EngineConfig::from_json_str(r#"{"sync_mode":"full"}"#).unwrap();
        assert_eq!(cfg.sync_mode, SyncMode::Full);
        assert_eq!(cfg.max_payload_bytes, u32::MAX);
        assert!(!cfg.exact_timestamps);
    }
}
