use super::filter::{candidate_pools, is_candidate, tolerated_pools};
use super::strategy::SelectionStrategy;
use crate::crd::{PoolResource, ResourcePhase, ResourcePool};
use crate::domain::ports::EventSeverity;
use crate::error::{Error, Result};
use crate::reconcile::{Action, Reconciler};
use crate::store::{emit_event, EventSinkRef, ListSelector, ObjectKey, TypedStore, WatchEvent};
use async_trait::async_trait;
use chrono::Utc;
use kube::Resource;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Assigns one pool to every unplaced request of kind `K`.
///
/// `Unscheduled -> Pending -> Scheduled`. Requests that are placed or being
/// deleted are left alone. Finding no pool is a waiting state, not an error:
/// a diagnostic event is emitted and pool changes re-trigger the request.
pub struct PoolScheduler<K: PoolResource> {
    name: String,
    kind: String,
    store: TypedStore,
    events: EventSinkRef,
    strategy: Arc<dyn SelectionStrategy>,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: PoolResource> PoolScheduler<K> {
    pub fn new(store: TypedStore, events: EventSinkRef, strategy: Arc<dyn SelectionStrategy>) -> Self {
        Self {
            name: format!("{}-scheduler", K::RESOURCE_KIND),
            kind: K::kind(&()).to_string(),
            store,
            events,
            strategy,
            namespace: None,
            _kind: PhantomData,
        }
    }

    /// Only schedule requests in one namespace
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Unplaced requests a pool could now host
    async fn requests_for_pool(&self, pool: &ResourcePool) -> Vec<ObjectKey> {
        if pool.is_deleting() || pool.spec.kind != K::RESOURCE_KIND {
            return Vec::new();
        }
        let requests: Vec<K> = match self.store.list(self.namespace.as_deref(), &ListSelector::all()).await {
            Ok(requests) => requests,
            Err(e) => {
                debug!(pool = %pool.name(), error = %e, "Failed to list requests for pool change");
                return Vec::new();
            }
        };

        requests
            .iter()
            .filter(|r| !r.is_deleting() && r.common().pool_ref.is_none())
            .filter(|r| is_candidate(pool, K::RESOURCE_KIND, r.common()))
            .map(|r| ObjectKey {
                kind: self.kind.clone(),
                namespace: r.meta().namespace.clone(),
                name: r.object_name().to_string(),
            })
            .collect()
    }

    async fn mark_pending(&self, key: &ObjectKey) -> Result<()> {
        self.store
            .patch_status(key.namespace.as_deref(), &key.name, |r: &mut K| {
                if r.common().pool_ref.is_some() || r.phase() == ResourcePhase::Pending {
                    return false;
                }
                let status = r.resource_status_mut();
                status.phase = ResourcePhase::Pending;
                status.message = Some("awaiting scheduling".into());
                status.last_update_time = Some(Utc::now());
                true
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<K: PoolResource> Reconciler for PoolScheduler<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    async fn map_event(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        match (event, event.kind()) {
            (WatchEvent::Applied(obj), Some("ResourcePool")) => {
                match self.store.registry().decode::<ResourcePool>(obj) {
                    Ok(pool) => self.requests_for_pool(&pool).await,
                    Err(e) => {
                        debug!(error = %e, "Ignoring undecodable pool");
                        Vec::new()
                    }
                }
            }
            (_, Some(kind)) if kind == self.kind => {
                ObjectKey::of(event.object()).ok().into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let namespace = key.namespace.as_deref();
        let Some(request) = self.store.get_opt::<K>(namespace, &key.name).await? else {
            return Ok(Action::Done);
        };
        if request.is_deleting() || request.common().pool_ref.is_some() {
            return Ok(Action::Done);
        }

        if request.phase() != ResourcePhase::Pending {
            self.mark_pending(key).await?;
            debug!("Marked request pending");
            return Ok(Action::Requeue(Duration::ZERO));
        }

        let class = request.common().class_ref.clone();
        let pools: Vec<ResourcePool> = self.store.list(None, &ListSelector::all()).await?;

        let candidates = candidate_pools(&pools, K::RESOURCE_KIND, request.common());
        if candidates.is_empty() {
            info!(class = %class, "No pool offers class");
            emit_event(
                self.events.as_ref(),
                request.object_ref(&()),
                EventSeverity::Warning,
                "NoPoolAvailable",
                format!("no pool for class {}", class),
            )
            .await;
            return Ok(Action::Done);
        }

        let tolerated = tolerated_pools(&candidates, &request.common().tolerations);
        if tolerated.is_empty() {
            info!(class = %class, candidates = candidates.len(), "No candidate pool tolerated");
            emit_event(
                self.events.as_ref(),
                request.object_ref(&()),
                EventSeverity::Warning,
                "NoToleratedPool",
                format!(
                    "no pool for class {} is tolerated ({} candidates have untolerated taints)",
                    class,
                    candidates.len()
                ),
            )
            .await;
            return Ok(Action::Done);
        }

        let chosen = self
            .strategy
            .select(&tolerated)
            .ok_or_else(|| Error::NoSuitablePool { class: class.clone() })?
            .name()
            .to_string();

        let updated = self
            .store
            .patch(namespace, &key.name, |r: &mut K| {
                if r.is_deleting() || r.common().pool_ref.is_some() {
                    return false;
                }
                r.common_mut().pool_ref = Some(chosen.clone());
                true
            })
            .await?;

        if updated.common().pool_ref.as_deref() == Some(chosen.as_str()) {
            info!(pool = %chosen, eligible = tolerated.len(), "Scheduled request");
            emit_event(
                self.events.as_ref(),
                updated.object_ref(&()),
                EventSeverity::Normal,
                "Scheduled",
                format!("assigned to pool {}", chosen),
            )
            .await;
        }
        Ok(Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AvailableClass, PoolResourceSpec, ResourceKind, ResourcePoolSpec, ResourcePoolStatus, Volume,
    };
    use crate::scheduler::strategy::tests::CountingRng;
    use crate::scheduler::RandomSelection;
    use crate::store::{MemoryStore, Registry};
    use k8s_openapi::api::core::v1::{Taint, Toleration};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    struct Fixture {
        memory: Arc<MemoryStore>,
        store: TypedStore,
        scheduler: PoolScheduler<Volume>,
    }

    fn fixture() -> Fixture {
        fixture_with(RandomSelection::with_rng(CountingRng(0)))
    }

    fn fixture_with(strategy: RandomSelection) -> Fixture {
        let memory = Arc::new(MemoryStore::new());
        let store = TypedStore::new(memory.clone(), Arc::new(Registry::with_defaults()));
        let scheduler = PoolScheduler::<Volume>::new(store.clone(), memory.clone(), Arc::new(strategy));
        Fixture {
            memory,
            store,
            scheduler,
        }
    }

    async fn add_pool(store: &TypedStore, name: &str, class: &str, taints: Vec<Taint>) {
        let mut pool = ResourcePool::new(
            name,
            ResourcePoolSpec {
                kind: ResourceKind::Volume,
                provider_id: None,
                taints,
            },
        );
        pool.status = Some(ResourcePoolStatus {
            available_classes: vec![AvailableClass {
                name: class.into(),
                capabilities: BTreeMap::new(),
            }],
            ..Default::default()
        });
        store.create(&pool).await.unwrap();
    }

    async fn add_volume(store: &TypedStore, name: &str, tolerations: Vec<Toleration>) -> ObjectKey {
        let mut vol = Volume::build(
            name,
            PoolResourceSpec {
                class_ref: "fast".into(),
                tolerations,
                ..Default::default()
            },
        );
        vol.metadata.namespace = Some("default".into());
        store.create(&vol).await.unwrap();
        ObjectKey::namespaced("Volume", "default", name)
    }

    async fn schedule(scheduler: &PoolScheduler<Volume>, key: &ObjectKey) -> Action {
        loop {
            match scheduler.reconcile(key).await.unwrap() {
                Action::Requeue(_) => continue,
                done => return done,
            }
        }
    }

    async fn pool_of(store: &TypedStore, name: &str) -> Option<String> {
        let vol: Volume = store.get(Some("default"), name).await.unwrap();
        vol.common().pool_ref.clone()
    }

    #[tokio::test]
    async fn test_pending_is_observable_before_search() {
        let f = fixture();
        add_pool(&f.store, "pool-a", "fast", vec![]).await;
        let key = add_volume(&f.store, "vol-1", vec![]).await;

        assert_eq!(f.scheduler.reconcile(&key).await.unwrap(), Action::Requeue(Duration::ZERO));
        let vol: Volume = f.store.get(Some("default"), "vol-1").await.unwrap();
        assert_eq!(vol.phase(), ResourcePhase::Pending);
        assert!(vol.common().pool_ref.is_none());

        assert_eq!(f.scheduler.reconcile(&key).await.unwrap(), Action::Done);
        assert_eq!(pool_of(&f.store, "vol-1").await.as_deref(), Some("pool-a"));

        // Placed requests are ignored from then on
        assert_eq!(f.scheduler.reconcile(&key).await.unwrap(), Action::Done);
    }

    #[tokio::test]
    async fn test_no_pool_emits_event_and_waits() {
        let f = fixture();
        add_pool(&f.store, "pool-a", "slow", vec![]).await;
        let key = add_volume(&f.store, "vol-1", vec![]).await;

        assert_eq!(schedule(&f.scheduler, &key).await, Action::Done);
        assert!(pool_of(&f.store, "vol-1").await.is_none());

        let events = f.memory.recorded_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "NoPoolAvailable");
        assert_eq!(events[0].message, "no pool for class fast");
        assert_eq!(events[0].regarding.name.as_deref(), Some("vol-1"));
    }

    #[tokio::test]
    async fn test_untolerated_pool_never_chosen() {
        let f = fixture();
        let taint = Taint {
            key: "dedicated".into(),
            value: None,
            effect: "NoSchedule".into(),
            time_added: None,
        };
        add_pool(&f.store, "tainted", "fast", vec![taint]).await;

        let key = add_volume(&f.store, "vol-0", vec![]).await;
        schedule(&f.scheduler, &key).await;
        assert!(pool_of(&f.store, "vol-0").await.is_none());
        assert_eq!(f.memory.recorded_events()[0].reason, "NoToleratedPool");

        add_pool(&f.store, "clean", "fast", vec![]).await;
        for i in 1..=10 {
            let key = add_volume(&f.store, &format!("vol-{}", i), vec![]).await;
            schedule(&f.scheduler, &key).await;
            assert_eq!(pool_of(&f.store, &format!("vol-{}", i)).await.as_deref(), Some("clean"));
        }

        // Exists on the key tolerates the key-only taint
        let exists = Toleration {
            key: Some("dedicated".into()),
            operator: Some("Exists".into()),
            ..Default::default()
        };
        let mut placed = BTreeMap::new();
        for i in 11..=14 {
            let key = add_volume(&f.store, &format!("vol-{}", i), vec![exists.clone()]).await;
            schedule(&f.scheduler, &key).await;
            let pool = pool_of(&f.store, &format!("vol-{}", i)).await.unwrap();
            *placed.entry(pool).or_insert(0) += 1;
        }
        assert_eq!(placed.get("tainted"), Some(&2));
        assert_eq!(placed.get("clean"), Some(&2));
    }

    #[tokio::test]
    async fn test_pool_change_retriggers_matching_requests() {
        let f = fixture();
        let waiting = add_volume(&f.store, "vol-1", vec![]).await;
        add_pool(&f.store, "pool-x", "fast", vec![]).await;
        let placed = add_volume(&f.store, "vol-2", vec![]).await;
        schedule(&f.scheduler, &placed).await;

        let pool: ResourcePool = f.store.get(None, "pool-x").await.unwrap();
        let event = WatchEvent::Applied(f.store.registry().encode(&pool).unwrap());
        let keys = f.scheduler.map_event(&event).await;
        assert_eq!(keys, vec![waiting]);
    }

    #[tokio::test]
    async fn test_fifty_requests_spread_over_two_pools() {
        let f = fixture();
        add_pool(&f.store, "pool-a", "fast", vec![]).await;
        add_pool(&f.store, "pool-b", "fast", vec![]).await;

        let mut counts: BTreeMap<String, i32> = BTreeMap::new();
        for i in 0..50 {
            let key = add_volume(&f.store, &format!("vol-{}", i), vec![]).await;
            schedule(&f.scheduler, &key).await;
            let pool = pool_of(&f.store, &format!("vol-{}", i)).await.unwrap();
            *counts.entry(pool).or_insert(0) += 1;
        }

        let a = counts.get("pool-a").copied().unwrap_or(0);
        let b = counts.get("pool-b").copied().unwrap_or(0);
        assert_eq!(a + b, 50);
        assert!((a - b).abs() < 5, "uneven spread: {} vs {}", a, b);
    }

    #[tokio::test]
    async fn test_seeded_random_selection_spreads_requests() {
        let f = fixture_with(RandomSelection::with_rng(StdRng::seed_from_u64(7)));
        add_pool(&f.store, "pool-a", "fast", vec![]).await;
        add_pool(&f.store, "pool-b", "fast", vec![]).await;

        let mut on_a = 0;
        for i in 0..400 {
            let name = format!("vol-{}", i);
            let key = add_volume(&f.store, &name, vec![]).await;
            schedule(&f.scheduler, &key).await;
            if pool_of(&f.store, &name).await.as_deref() == Some("pool-a") {
                on_a += 1;
            }
        }
        assert!((140..=260).contains(&on_a), "uneven spread: {} of 400 on pool-a", on_a);
    }
}
