//! Broker Reconciler
//!
//! Serves the runtime protocol for one resource kind on top of a backend
//! store. Every runtime object is an aggregate: a primary request object plus
//! an optional secret it references. Creation is a fixed sequence of store
//! writes with compensating deletes on failure.
//!
//! - [`identifier`]: collision-resistant object names
//! - [`convert`]: ownership markers and the label-snapshot side channel
//! - [`aggregate`]: in-memory assembly and the rollback guard
//! - [`Broker`]: the [`Runtime`](crate::domain::ports::Runtime) implementation

pub mod aggregate;
pub mod convert;
pub mod identifier;

mod broker;

pub use aggregate::Aggregate;
pub use broker::{aggregate_status, Broker};
pub use convert::LabelSnapshot;
pub use identifier::{generate_id, DEFAULT_ID_LENGTH};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Value of the manager label on every object this broker creates
    pub manager: String,
    /// Backend namespace holding the aggregates
    pub namespace: String,
    /// Length of generated identifiers
    pub id_length: usize,
    /// Pool selector applied to every backend request
    pub pool_selector: BTreeMap<String, String>,
    /// Upper bound for one create call
    #[serde(with = "crate::config::duration_secs")]
    pub create_timeout: Duration,
    /// Budget for compensating deletes after a failed create
    #[serde(with = "crate::config::duration_secs")]
    pub cleanup_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            manager: "pool-broker".to_string(),
            namespace: "default".to_string(),
            id_length: DEFAULT_ID_LENGTH,
            pool_selector: BTreeMap::new(),
            create_timeout: Duration::from_secs(30),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}
