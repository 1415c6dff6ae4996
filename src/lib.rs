//! Pool Broker - pool-scoped control plane
//!
//! Maps workload, volume and bucket requests onto runtime pools and brokers
//! them to a backend that only knows its own classes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Front Store                                    │
//! │   ResourceClass      ResourcePool      Volume / Bucket / Workload           │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐        ┌──────────────────────────────────────────┐    │
//! │  │ Pool Scheduler  │        │ Poollet (one per pool)                   │    │
//! │  │ class, selector,│        │  pool status · resource · event relay    │    │
//! │  │ taints, random  │        └────────────────────┬─────────────────────┘    │
//! │  └─────────────────┘                             │ Runtime protocol (HTTP)  │
//! ├──────────────────────────────────────────────────┼──────────────────────────┤
//! │                                                  ▼                          │
//! │  ┌─────────────────────────┐     ┌──────────────────────────────────────┐   │
//! │  │ Capability Class Mapper │ ◄── │ Broker (aggregate create + rollback) │   │
//! │  └─────────────────────────┘     └──────────────────────────────────────┘   │
//! │                              Backend Store                                  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`scheduler`]: places requests on pools
//! - [`classes`]: resolves front classes to runtime classes by capability
//! - [`broker`]: implements the runtime protocol over a backend store
//! - [`poollet`]: drives one pool's runtime from the front store
//! - [`api`]: runtime protocol over HTTP
//! - [`store`]: resource store port with in-memory and Kubernetes adapters
//! - [`reconcile`]: work-queue controller loop
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: runtime protocol types and ports
//! - [`error`]: Error types and handling

pub mod api;
pub mod broker;
pub mod classes;
pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod poollet;
pub mod reconcile;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use api::{ApiServerConfig, RemoteRuntime, RuntimeRouter};

pub use broker::{Broker, BrokerConfig};

pub use classes::{CapabilitySignature, ClassMapper, ClassMapperConfig};

pub use config::Settings;

pub use crd::{
    Bucket, PoolResource, ResourceClass, ResourceKind, ResourcePool, Volume, Workload,
};

pub use domain::ports::{ClassInfo, ClassSource, Runtime, RuntimeObject, RuntimeRef};

pub use error::{Error, ErrorAction, Result};

pub use metrics::Metrics;

pub use poollet::{EventRelay, EventRelayConfig, PoolStatusReconciler, PoolletConfig, ResourceReconciler};

pub use reconcile::{Action, Controller, ControllerConfig, Reconciler};

pub use scheduler::{PoolScheduler, RandomSelection, SchedulerConfig, SelectionStrategy};

pub use store::{KubeStore, MemoryStore, Registry, ResourceStore, ResourceStoreRef, TypedStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
