use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PARALLELISM: usize = 8;
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Engine tuning knobs shared by every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of steps executing at once.
    pub parallelism: usize,
    pub timeouts: DefaultTimeouts,
    /// Capacity of each event sink's channel.
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            timeouts: DefaultTimeouts::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    pub fn parallelism(&self) -> usize {
        self.parallelism.max(1)
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer.max(1)
    }
}

/// Deadlines used when a resource declares no custom timeout, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultTimeouts {
    pub create: u64,
    pub update: u64,
    pub delete: u64,
    /// Check, diff and read.
    pub read: u64,
}

impl Default for DefaultTimeouts {
    fn default() -> Self {
        Self {
            create: 20 * 60,
            update: 20 * 60,
            delete: 20 * 60,
            read: 5 * 60,
        }
    }
}

impl DefaultTimeouts {
    pub fn create(&self) -> Duration {
        Duration::from_secs(self.create)
    }

    pub fn update(&self) -> Duration {
        Duration::from_secs(self.update)
    }

    pub fn delete(&self) -> Duration {
        Duration::from_secs(self.delete)
    }

    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"parallelism": 2}"#).unwrap();
        assert_eq!(config.parallelism(), 2);
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
        assert_eq!(config.timeouts.read(), Duration::from_secs(300));
    }

    #[test]
    fn zero_parallelism_still_runs_one_step() {
        let config = EngineConfig {
            parallelism: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.parallelism(), 1);
    }
}
