use std::time::Duration;

use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

use crate::topic::TopicConfig;

/// Broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Delivery/parked queue capacity per session.
    pub queue_capacity: usize,
    /// History depth of the system dead-letter topic.
    pub dead_letter_history: usize,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
    pub topic: TopicSettings,
}

/// Defaults applied to topics that publish without an explicit config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSettings {
    pub history_max: usize,
    pub destroy_delay_ms: u64,
    pub history_on_subscribe: bool,
    pub record_unchanged: bool,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            // Adding default values
            .set_default("queue_capacity", 64)?
            .set_default("dead_letter_history", 32)?
            .set_default("event_capacity", 256)?
            .set_default("topic.history_max", 16)?
            .set_default("topic.destroy_delay_ms", 60_000)?
            .set_default("topic.history_on_subscribe", true)?
            .set_default("topic.record_unchanged", true)?
            // Add environment variables with the VESTNIK_ prefix,
            // VESTNIK_TOPIC__HISTORY_MAX addresses the nested section.
            .add_source(Environment::with_prefix("VESTNIK").separator("__"))
            .build()?;

        cfg.try_deserialize()
    }

    pub fn topic_defaults(&self) -> TopicConfig {
        TopicConfig {
            history_max: self.topic.history_max,
            destroy_delay: Duration::from_millis(self.topic.destroy_delay_ms),
            read_only: false,
            history_on_subscribe: self.topic.history_on_subscribe,
            record_unchanged: self.topic.record_unchanged,
        }
    }
}
