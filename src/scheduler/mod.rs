//! Pool Scheduler
//!
//! Places unplaced Workload/Volume/Bucket requests onto pools:
//! - [`filter`]: class, selector, deletion and taint/toleration filtering
//! - [`strategy`]: the pluggable choice among eligible pools
//! - [`PoolScheduler`]: the reconciler tying both to the store

pub mod filter;
pub mod strategy;

mod controller;

pub use controller::PoolScheduler;
pub use strategy::{RandomSelection, SelectionStrategy};

use crate::reconcile::ControllerConfig;
use serde::{Deserialize, Serialize};

/// Scheduler process settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Restrict scheduling to one namespace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Work-queue tuning
    pub controller: ControllerConfig,
}
