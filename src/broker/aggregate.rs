//! Aggregate assembly and create rollback

use super::convert::{LabelSnapshot, MANAGER_LABEL};
use super::{generate_id, BrokerConfig};
use crate::crd::{PoolResource, PoolResourceSpec, DOMAIN};
use crate::domain::ports::{AccessInfo, ClassInfo, RuntimeObject};
use crate::error::Result;
use crate::store::{ObjectKey, ResourceStoreRef};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A primary request object plus the secret it references
#[derive(Debug, Clone)]
pub struct Aggregate<K> {
    pub primary: K,
    pub secret: Option<Secret>,
}

impl<K: PoolResource> Aggregate<K> {
    /// Build the backend objects for a runtime create request.
    ///
    /// The secret is built first so the primary can reference it by name.
    pub fn assemble(config: &BrokerConfig, class: &ClassInfo, object: &RuntimeObject) -> Result<Self> {
        let managed = || {
            Some(BTreeMap::from([(
                MANAGER_LABEL.to_string(),
                config.manager.clone(),
            )]))
        };

        let secret = object.spec.secret_data.as_ref().map(|payload| Secret {
            metadata: ObjectMeta {
                name: Some(generate_id(config.id_length)),
                namespace: Some(config.namespace.clone()),
                labels: managed(),
                ..Default::default()
            },
            type_: Some(format!("{}/{}", DOMAIN, K::RESOURCE_KIND.secret_purpose())),
            data: Some(
                payload
                    .iter()
                    .map(|(k, v)| (k.clone(), ByteString(v.clone().into_bytes())))
                    .collect(),
            ),
            ..Default::default()
        });

        let mut primary = K::build(
            &generate_id(config.id_length),
            PoolResourceSpec {
                class_ref: class.name.clone(),
                pool_ref: None,
                pool_selector: config.pool_selector.clone(),
                tolerations: Vec::new(),
                resources: object.spec.resources.clone(),
                secret_ref: secret.as_ref().and_then(|s| s.metadata.name.clone()),
            },
        );
        primary.set_image(object.spec.image.clone());

        let meta = primary.meta_mut();
        meta.namespace = Some(config.namespace.clone());
        meta.labels = managed();
        LabelSnapshot::new(
            object.metadata.labels.clone(),
            object.metadata.annotations.clone(),
        )
        .encode_into(meta)?;

        Ok(Self { primary, secret })
    }
}

/// Name of the access secret a backend writes for an available object
pub fn access_secret_name(id: &str) -> String {
    format!("{}-access", id)
}

/// Decode a secret's payload; `stringData` wins over `data` on conflicts
pub fn secret_payload(secret: &Secret) -> AccessInfo {
    let mut secret_data: BTreeMap<String, String> = secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(&v.0).into_owned()))
        .collect();
    if let Some(string_data) = &secret.string_data {
        secret_data.extend(string_data.clone());
    }
    AccessInfo { secret_data }
}

// =============================================================================
// Rollback
// =============================================================================

/// Tracks objects written, or being written, by an in-flight create.
///
/// `unwind` deletes them most-recent first. A guard dropped while still
/// armed (the create future was cancelled or timed out) spawns the same
/// cleanup on the runtime, so it is never tied to the caller's deadline.
pub struct Rollback {
    store: ResourceStoreRef,
    created: Vec<ObjectKey>,
    timeout: Duration,
}

impl Rollback {
    pub fn new(store: ResourceStoreRef, timeout: Duration) -> Self {
        Self {
            store,
            created: Vec::new(),
            timeout,
        }
    }

    /// Record a write before it is issued. A write still in flight when the
    /// create is abandoned may commit afterwards, so it must already be
    /// tracked; deleting a key that never landed is a no-op.
    pub fn track(&mut self, key: ObjectKey) {
        self.created.push(key);
    }

    /// Drop a tracked key whose write was rejected, e.g. because the name
    /// already belonged to another object
    pub fn forget(&mut self, key: &ObjectKey) {
        self.created.retain(|k| k != key);
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Keep everything written so far
    pub fn commit(mut self) {
        self.created.clear();
    }

    /// Delete everything written so far and wait for the cleanup to finish
    pub async fn unwind(mut self) {
        let created = std::mem::take(&mut self.created);
        let cleanup = tokio::spawn(undo(self.store.clone(), created, self.timeout));
        if let Err(e) = cleanup.await {
            warn!(error = %e, "Rollback task failed");
        }
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.created.is_empty() {
            return;
        }
        let created = std::mem::take(&mut self.created);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                info!(objects = created.len(), "Create abandoned, rolling back");
                handle.spawn(undo(self.store.clone(), created, self.timeout));
            }
            Err(_) => {
                warn!(objects = ?created, "Create abandoned outside a runtime, objects left behind");
            }
        }
    }
}

async fn undo(store: ResourceStoreRef, created: Vec<ObjectKey>, timeout: Duration) {
    let work = async {
        for key in created.iter().rev() {
            match store.delete(key).await {
                Ok(()) => debug!(kind = %key.kind, key = %key, "Rolled back"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(kind = %key.kind, key = %key, error = %e, "Rollback delete failed"),
            }
        }
    };
    if tokio::time::timeout(timeout, work).await.is_err() {
        warn!(objects = created.len(), "Rollback timed out");
    }
}
