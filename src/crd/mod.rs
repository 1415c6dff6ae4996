//! Custom Resource Definitions for the pool broker
//!
//! - `ResourcePool`: one backend runtime instance with its classes and capacity
//! - `ResourceClass`: a named capability bundle for one resource kind
//! - `Volume`, `Bucket`, `Workload`: pool-scoped requests sharing one spec shape

mod class;
mod pool;
mod resource;

pub use class::*;
pub use pool::*;
pub use resource::*;

use kube::CustomResourceExt;

/// Prefix for every label, annotation and finalizer this crate owns
pub const DOMAIN: &str = "pool-broker.io";

/// All CRDs served by this crate, in install order
pub fn all_crds() -> Vec<k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition> {
    vec![
        ResourceClass::crd(),
        ResourcePool::crd(),
        Volume::crd(),
        Bucket::crd(),
        Workload::crd(),
    ]
}
