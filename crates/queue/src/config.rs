use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::QueueError;

/// Queue sizing and render-thread behavior.
///
/// Loaded from JSON by the tools; every field is optional there and falls
/// back to [`QueueConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Records the ring holds. Must be a power of two. Records the render
    /// thread is still draining occupy the ring too, so the room for one
    /// flush is this minus the previous batch; size it for two frames.
    pub ring_capacity: usize,
    /// Size of the handle table, including the reserved null slot.
    pub slot_capacity: usize,
    /// Longest `flush` waits for the render thread to pick up a drain.
    /// `None` blocks indefinitely.
    #[serde(with = "millis")]
    pub watchdog: Option<Duration>,
    /// Backend misuse panics the render thread instead of being logged.
    pub strict: bool,
    pub thread_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 1 << 16,
            slot_capacity: 10_000,
            watchdog: None,
            strict: cfg!(debug_assertions),
            thread_name: "rhi-render".to_owned(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.ring_capacity < 2 || !self.ring_capacity.is_power_of_two() {
            return Err(QueueError::InvalidConfig(format!(
                "ring_capacity must be a power of two >= 2, got {}",
                self.ring_capacity
            )));
        }
        if self.slot_capacity < 2 || self.slot_capacity > u32::MAX as usize {
            return Err(QueueError::InvalidConfig(format!(
                "slot_capacity must be in 2..=u32::MAX, got {}",
                self.slot_capacity
            )));
        }
        if self.watchdog == Some(Duration::ZERO) {
            return Err(QueueError::InvalidConfig(
                "watchdog must be non-zero (omit it to disable)".into(),
            ));
        }
        if self.thread_name.is_empty() || self.thread_name.contains('\0') {
            return Err(QueueError::InvalidConfig(
                "thread_name must be non-empty and free of NUL bytes".into(),
            ));
        }
        Ok(())
    }
}

/// `Option<Duration>` as an optional integer number of milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => ser.serialize_some(&(d.as_millis() as u64)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(de)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.slot_capacity, 10_000);
        assert!(config.watchdog.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn ring_capacity_must_be_power_of_two() {
        let config = QueueConfig {
            ring_capacity: 1000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QueueError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tiny_slot_table_rejected() {
        let config = QueueConfig {
            slot_capacity: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_fields_are_optional() {
        let config: QueueConfig =
            serde_json::from_str(r#"{ "ring_capacity": 256, "watchdog": 1500 }"#).unwrap();
        assert_eq!(config.ring_capacity, 256);
        assert_eq!(config.watchdog, Some(Duration::from_millis(1500)));
        assert_eq!(config.slot_capacity, 10_000);
    }

    #[test]
    fn json_round_trip() {
        let config = QueueConfig {
            watchdog: Some(Duration::from_millis(250)),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: QueueConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
