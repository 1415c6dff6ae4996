use crate::classes::ClassMapper;
use crate::crd::{AvailableClass, PoolCondition, PoolPhase, ResourceClass, ResourceKind, ResourcePool, ResourcePoolSpec};
use crate::domain::ports::{PoolTarget, RuntimeRef};
use crate::error::{Error, Result};
use crate::reconcile::run_periodic;
use crate::store::{ListSelector, TypedStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SYNCED_CONDITION: &str = "Synced";

/// Keeps one pool's status in line with what its runtime reports.
///
/// Front classes that resolve against the runtime's classes become the
/// pool's available classes; the runtime quantity of the resolved class
/// becomes the allocatable amount. Both are replaced wholesale on every pass.
pub struct PoolStatusReconciler {
    pool_name: String,
    kind: ResourceKind,
    store: TypedStore,
    runtime: RuntimeRef,
    classes: Arc<ClassMapper>,
    interval: Duration,
}

impl PoolStatusReconciler {
    pub fn new(
        pool_name: impl Into<String>,
        store: TypedStore,
        runtime: RuntimeRef,
        classes: Arc<ClassMapper>,
        interval: Duration,
    ) -> Self {
        let kind = runtime.kind();
        Self {
            pool_name: pool_name.into(),
            kind,
            store,
            runtime,
            classes,
            interval,
        }
    }

    /// One refresh pass
    pub async fn sync(&self) -> Result<()> {
        self.ensure_pool().await?;
        if !self.classes.has_synced() {
            debug!(pool = %self.pool_name, "Runtime classes not synced yet");
            return Ok(());
        }

        let now = Utc::now();
        match self.observe().await {
            Ok((available, allocatable)) => {
                let count = available.len();
                self.store
                    .patch_status(None, &self.pool_name, |pool: &mut ResourcePool| {
                        let status = pool.status.get_or_insert_with(Default::default);
                        status.available_classes = available.clone();
                        status.allocatable = allocatable.clone();
                        status.phase = PoolPhase::Ready;
                        status.last_sync_time = Some(now);
                        let condition = synced(&status.conditions, "True", "RuntimeReachable", None, now);
                        status.set_condition(condition);
                        true
                    })
                    .await?;
                debug!(pool = %self.pool_name, classes = count, "Synced pool status");
                Ok(())
            }
            Err(e) => {
                warn!(pool = %self.pool_name, error = %e, "Runtime status failed");
                let message = e.to_string();
                self.store
                    .patch_status(None, &self.pool_name, |pool: &mut ResourcePool| {
                        let status = pool.status.get_or_insert_with(Default::default);
                        status.phase = PoolPhase::Unavailable;
                        let condition =
                            synced(&status.conditions, "False", "RuntimeUnavailable", Some(message.clone()), now);
                        status.set_condition(condition);
                        true
                    })
                    .await?;
                Err(e)
            }
        }
    }

    async fn observe(&self) -> Result<(Vec<AvailableClass>, BTreeMap<String, i64>)> {
        let rows = self.runtime.status(&PoolTarget::default()).await?;
        let quantities: BTreeMap<&str, i64> = rows
            .iter()
            .map(|row| (row.class.name.as_str(), row.quantity))
            .collect();

        let front: Vec<ResourceClass> = self.store.list(None, &ListSelector::all()).await?;
        let mut available = Vec::new();
        let mut allocatable = BTreeMap::new();
        for class in front.iter().filter(|c| c.spec.kind == self.kind) {
            match self.classes.resolve(class.name(), &class.spec.capabilities) {
                Ok(resolved) => {
                    available.push(AvailableClass {
                        name: class.name().to_string(),
                        capabilities: class.spec.capabilities.clone(),
                    });
                    if let Some(quantity) = quantities.get(resolved.name.as_str()) {
                        allocatable.insert(class.name().to_string(), *quantity);
                    }
                }
                Err(e) if e.is_class_unresolved() => {
                    debug!(class = %class.name(), reason = %e, "Class not offered by runtime");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((available, allocatable))
    }

    /// Register the pool object if it does not exist yet
    async fn ensure_pool(&self) -> Result<()> {
        match self.store.get_opt::<ResourcePool>(None, &self.pool_name).await? {
            Some(pool) if pool.spec.kind != self.kind => Err(Error::Configuration(format!(
                "pool {} serves {} but the runtime serves {}",
                self.pool_name, pool.spec.kind, self.kind
            ))),
            Some(_) => Ok(()),
            None => {
                let pool = ResourcePool::new(
                    &self.pool_name,
                    ResourcePoolSpec {
                        kind: self.kind,
                        provider_id: Some(self.pool_name.clone()),
                        taints: Vec::new(),
                    },
                );
                self.store.create(&pool).await?;
                info!(pool = %self.pool_name, kind = %self.kind, "Registered pool");
                Ok(())
            }
        }
    }

    /// Refresh on the configured period until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let name = format!("{}-pool-status", self.pool_name);
        let period = self.interval;
        run_periodic(&name, period, shutdown, || {
            let reconciler = Arc::clone(&self);
            async move { reconciler.sync().await }
        })
        .await;
    }
}

/// The Synced condition, keeping its transition time while the status holds
fn synced(
    existing: &[PoolCondition],
    status: &str,
    reason: &str,
    message: Option<String>,
    now: DateTime<Utc>,
) -> PoolCondition {
    let last_transition_time = existing
        .iter()
        .find(|c| c.r#type == SYNCED_CONDITION && c.status == status)
        .and_then(|c| c.last_transition_time)
        .or(Some(now));
    PoolCondition {
        r#type: SYNCED_CONDITION.to_string(),
        status: status.to_string(),
        last_transition_time,
        reason: Some(reason.to_string()),
        message,
    }
}
