//! Engine configuration.
//!
//! Loading is a collaborator concern; this module only defines the
//! tunables and their defaults. The struct derives serde traits so
//! embedders can source it from whatever format they already use.

use serde::{Deserialize, Serialize};

/// Tunables for the protocol engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container identifier advertised in our OPEN.
    pub container_id: String,
    /// Session outgoing window advertised in our BEGIN.
    pub outgoing_window: u32,
    /// Max frame size offered when the peer's OPEN carries one, and
    /// assumed when it does not.
    pub max_frame_size: u32,
    /// Delivery count advertised on sender-role ATTACH replies.
    pub initial_delivery_count: u32,
    /// Capacity in bytes of each reassembly slot.
    pub slot_capacity: usize,
    /// Total number of reassembly slots shared by all connections.
    pub slot_count: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_id: "amqpgate".to_owned(),
            outgoing_window: 8,
            max_frame_size: 4096,
            initial_delivery_count: 0,
            slot_capacity: 64 * 1024,
            slot_count: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EngineConfig;

    #[test]
    fn defaults_are_self_consistent() {
        let config = EngineConfig::default();
        assert!(config.slot_capacity >= config.max_frame_size as usize);
        assert!(config.slot_count > 0);
    }

    #[test]
    fn overrides_compose_with_defaults() {
        let config = EngineConfig {
            container_id: "broker-1".to_owned(),
            ..EngineConfig::default()
        };
        assert_eq!(config.container_id, "broker-1");
        assert_eq!(config.max_frame_size, EngineConfig::default().max_frame_size);
    }
}
