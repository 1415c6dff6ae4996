//! Process configuration
//!
//! Every component carries its own `*Config` struct with defaults. A YAML
//! file passed with `--config` may override any subset of them; fields it
//! leaves out keep their defaults.

use crate::api::ApiServerConfig;
use crate::broker::BrokerConfig;
use crate::classes::ClassMapperConfig;
use crate::error::{Error, Result};
use crate::poollet::{EventRelayConfig, PoolletConfig};
use crate::scheduler::SchedulerConfig;
use crate::store::MemoryStoreConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// All component settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub api: ApiServerConfig,
    pub broker: BrokerConfig,
    pub class_mapper: ClassMapperConfig,
    pub event_relay: EventRelayConfig,
    pub memory_store: MemoryStoreConfig,
    pub poollet: PoolletConfig,
    pub scheduler: SchedulerConfig,
}

impl Settings {
    /// Load settings from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let settings: Settings = serde_yaml::from_str(&raw)?;
        settings.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(settings)
    }

    /// Reject settings no component can run with
    pub fn validate(&self) -> Result<()> {
        if self.broker.id_length == 0 {
            return Err(Error::Configuration("broker.idLength must be positive".into()));
        }
        if self.broker.manager.is_empty() {
            return Err(Error::Configuration("broker.manager must not be empty".into()));
        }
        if self.memory_store.event_capacity == 0 {
            return Err(Error::Configuration("memoryStore.eventCapacity must be positive".into()));
        }
        if self.class_mapper.refresh_interval.is_zero() || self.event_relay.period.is_zero() {
            return Err(Error::Configuration("refresh periods must be positive".into()));
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serialize a `Duration` as whole milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
