//! Poollet
//!
//! Front-side controllers for one pool, talking to that pool's runtime:
//! - [`PoolStatusReconciler`]: mirrors runtime classes and capacity into the
//!   pool status
//! - [`ResourceReconciler`]: creates, expands and deletes runtime objects for
//!   requests placed on the pool
//! - [`EventRelay`]: re-emits runtime events against the owning requests

mod events;
mod pool;
mod resource;

pub use events::{EventRelay, EventRelayConfig};
pub use pool::PoolStatusReconciler;
pub use resource::ResourceReconciler;

use crate::reconcile::ControllerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Label carrying the namespace of the front object
pub const NAMESPACE_LABEL: &str = "pool-broker.io/namespace";

/// Label carrying the name of the front object
pub const NAME_LABEL: &str = "pool-broker.io/name";

/// Label carrying the uid of the front object
pub const UID_LABEL: &str = "pool-broker.io/uid";

/// Finalizer held while a runtime object may exist
pub const FINALIZER: &str = "pool-broker.io/poollet";

/// Poollet settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolletConfig {
    /// Name of the pool this poollet serves
    pub pool_name: String,
    /// Restrict the request watch to one namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Period of the pool status refresh
    #[serde(with = "crate::config::duration_secs")]
    pub status_interval: Duration,
    /// Re-check period for placed requests
    #[serde(with = "crate::config::duration_secs")]
    pub resync_interval: Duration,
    /// Work-queue tuning
    pub controller: ControllerConfig,
}

impl Default for PoolletConfig {
    fn default() -> Self {
        Self {
            pool_name: "default".to_string(),
            namespace: None,
            status_interval: Duration::from_secs(60),
            resync_interval: Duration::from_secs(30),
            controller: ControllerConfig::default(),
        }
    }
}
