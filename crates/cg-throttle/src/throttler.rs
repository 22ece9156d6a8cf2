//! Throttler - the root registry.
//!
//! Owns one [`ThrottleGroupSet`] per group type (connector family), each
//! owning its named [`ThrottleGroup`]s. The maps at both levels exist for
//! structural mutation only; every wait in the engine happens on bin-local
//! primitives, never under these maps.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use cg_common::GroupStats;

use crate::error::ThrottleError;
use crate::group::ThrottleGroup;
use crate::handle::ConnectionThrottler;
use crate::registry::{service_name, ClusterRegistry, LocalRegistry};
use crate::spec::ThrottleSpec;
use crate::throttle_metrics;
use crate::Result;

pub struct Throttler {
    group_sets: DashMap<Arc<str>, Arc<ThrottleGroupSet>>,
    registry: Arc<dyn ClusterRegistry>,
}

impl Throttler {
    /// Throttler with local-only service registration.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(LocalRegistry))
    }

    /// Throttler registering group service activities with a cluster lock
    /// manager.
    pub fn with_registry(registry: Arc<dyn ClusterRegistry>) -> Self {
        Self {
            group_sets: DashMap::new(),
            registry,
        }
    }

    /// Install or replace the spec for a group, creating the group when
    /// absent. Idempotent; outstanding handles keep working and see the new
    /// limits at their next operation.
    pub async fn create_or_update(
        &self,
        group_type: &str,
        group_name: &str,
        spec: Arc<dyn ThrottleSpec>,
    ) -> Result<()> {
        self.group_set(group_type)
            .create_or_update(group_name, spec, &self.registry)
            .await
    }

    /// Destroy a group. Waiters on any of its bins are released with the
    /// shutting-down indication; outstanding handles fail their next
    /// operation.
    pub async fn remove(&self, group_type: &str, group_name: &str) {
        let Some(set) = self.group_sets.get(group_type).map(|s| Arc::clone(s.value())) else {
            return;
        };
        set.remove(group_name, &self.registry).await;
    }

    /// Snapshot of the group names known under a type.
    pub fn groups(&self, group_type: &str) -> Vec<String> {
        self.group_sets
            .get(group_type)
            .map(|set| set.group_names())
            .unwrap_or_default()
    }

    /// Non-blocking lookup of a connection permission source. `None` when
    /// the group does not exist or is tearing down.
    pub fn obtain_connection_throttler(
        &self,
        group_type: &str,
        group_name: &str,
        bin_names: &[&str],
    ) -> Option<ConnectionThrottler> {
        let set = self.group_sets.get(group_type)?;
        let group = set.group(group_name)?;
        if !group.is_alive() {
            return None;
        }
        let bin_names: Arc<[Arc<str>]> = bin_names.iter().map(|name| Arc::from(*name)).collect();
        Some(ConnectionThrottler::new(Arc::downgrade(&group), bin_names))
    }

    /// Refresh every bin of every group of a type from its live spec.
    /// Idempotent absent spec changes.
    pub fn poll(&self, group_type: &str) -> Result<()> {
        let Some(set) = self.group_sets.get(group_type).map(|s| Arc::clone(s.value())) else {
            return Ok(());
        };
        for group in set.all_groups() {
            group.refresh_from_spec()?;
        }
        Ok(())
    }

    /// Drop bins with no open resources and no waiters, across all groups.
    pub fn free_unused_resources(&self) {
        for set in self.group_sets.iter() {
            for group in set.value().all_groups() {
                group.free_unused_resources();
            }
        }
    }

    /// Remove every group across all types.
    pub async fn destroy(&self) {
        info!("Destroying throttler");
        let sets: Vec<Arc<ThrottleGroupSet>> = self
            .group_sets
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();
        for set in sets {
            for name in set.group_names() {
                set.remove(&name, &self.registry).await;
            }
        }
        self.group_sets.clear();
    }

    /// Stats snapshots for every group of a type.
    pub fn stats(&self, group_type: &str) -> Vec<GroupStats> {
        self.group_sets
            .get(group_type)
            .map(|set| set.all_groups().iter().map(|g| g.stats()).collect())
            .unwrap_or_default()
    }

    fn group_set(&self, group_type: &str) -> Arc<ThrottleGroupSet> {
        if let Some(set) = self.group_sets.get(group_type) {
            return Arc::clone(set.value());
        }
        self.group_sets
            .entry(Arc::from(group_type))
            .or_insert_with(|| Arc::new(ThrottleGroupSet::new(Arc::from(group_type))))
            .clone()
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

/// Namespace of throttle groups for one connector family.
pub(crate) struct ThrottleGroupSet {
    group_type: Arc<str>,
    groups: DashMap<Arc<str>, Arc<ThrottleGroup>>,
}

impl ThrottleGroupSet {
    fn new(group_type: Arc<str>) -> Self {
        Self {
            group_type,
            groups: DashMap::new(),
        }
    }

    fn group(&self, name: &str) -> Option<Arc<ThrottleGroup>> {
        self.groups.get(name).map(|g| Arc::clone(g.value()))
    }

    fn group_names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.key().to_string()).collect()
    }

    fn all_groups(&self) -> Vec<Arc<ThrottleGroup>> {
        self.groups.iter().map(|g| Arc::clone(g.value())).collect()
    }

    async fn create_or_update(
        &self,
        name: &str,
        spec: Arc<dyn ThrottleSpec>,
        registry: &Arc<dyn ClusterRegistry>,
    ) -> Result<()> {
        if let Some(group) = self.group(name) {
            info!(group_type = %self.group_type, group = %name, "Updating throttle group spec");
            return group.set_spec(spec);
        }

        // Register before publishing the group; registration failures leave
        // no group behind.
        let service = registry
            .register_service(&service_name(&self.group_type, name))
            .await
            .map_err(|e| ThrottleError::Registry(e.to_string()))?;

        let group = Arc::new(ThrottleGroup::new(
            Arc::clone(&self.group_type),
            Arc::from(name),
            Arc::clone(&spec),
            service.clone(),
        ));

        match self.groups.entry(Arc::from(name)) {
            Entry::Vacant(vacant) => {
                vacant.insert(group);
                info!(group_type = %self.group_type, group = %name, "Created throttle group");
                Ok(())
            }
            Entry::Occupied(occupied) => {
                // Lost a creation race: keep the winner, fold our spec in,
                // and end the activity we registered for the loser.
                let winner = Arc::clone(occupied.get());
                drop(occupied);
                if let Err(e) = registry.end_service(&service).await {
                    warn!(
                        group_type = %self.group_type,
                        group = %name,
                        error = %e,
                        "Failed to end service activity for duplicate group"
                    );
                }
                winner.set_spec(spec)
            }
        }
    }

    async fn remove(&self, name: &str, registry: &Arc<dyn ClusterRegistry>) {
        if let Some((_, group)) = self.groups.remove(name) {
            group.shut_down(registry).await;
            throttle_metrics::record_group_removed(&self.group_type);
        }
    }
}
