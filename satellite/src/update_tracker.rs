// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bookkeeping of pending update notifications
//!
//! Apply handlers and event sources record which objects changed (or need to
//! be re-checked) in the [`UpdateTracker`].  The device manager collects the
//! accumulated notifications as one [`UpdateBundle`] at the start of each
//! reconciliation cycle.  Repeated notifications for the same object coalesce;
//! the newest UUID wins.

use crate::shutdown::{self, ShutdownRequested};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use stormesh_common::identity::{NodeName, ResourceName, StorPoolName};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

/// Pending notifications, one coalescing map per object kind
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UpdateBundle {
    pub nodes: BTreeMap<NodeName, Uuid>,
    pub resource_definitions: BTreeMap<ResourceName, Uuid>,
    pub stor_pools: BTreeMap<StorPoolName, Uuid>,
    /// Resources to re-evaluate locally without asking the controller
    pub check_resources: BTreeMap<ResourceName, Uuid>,
    /// Resource name => node name => UUID of that node's instance
    pub resources: BTreeMap<ResourceName, BTreeMap<NodeName, Uuid>>,
}

impl UpdateBundle {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
            && self.resource_definitions.is_empty()
            && self.stor_pools.is_empty()
            && self.check_resources.is_empty()
            && self.resources.is_empty()
    }

    pub fn clear(&mut self) {
        *self = UpdateBundle::default();
    }

    /// Moves every entry of `other` into this bundle, overwriting UUIDs of
    /// entries that exist in both
    pub fn absorb(&mut self, other: UpdateBundle) {
        self.nodes.extend(other.nodes);
        self.resource_definitions.extend(other.resource_definitions);
        self.stor_pools.extend(other.stor_pools);
        self.check_resources.extend(other.check_resources);
        for (rsc_name, node_map) in other.resources {
            self.resources.entry(rsc_name).or_default().extend(node_map);
        }
    }

    /// Copies the entries that require a controller round trip into `target`
    ///
    /// Check-only entries are not copied: nothing is requested for them, so
    /// no confirmation will ever arrive.
    pub fn copy_update_requests_to(&self, target: &mut UpdateBundle) {
        target.nodes.extend(self.nodes.clone());
        target
            .resource_definitions
            .extend(self.resource_definitions.clone());
        target.stor_pools.extend(self.stor_pools.clone());
        for (rsc_name, node_map) in &self.resources {
            target
                .resources
                .entry(rsc_name.clone())
                .or_default()
                .extend(node_map.clone());
        }
    }

    /// Names of every resource a device handler must run for once this
    /// bundle's updates have been received
    pub fn affected_resources(&self) -> BTreeSet<ResourceName> {
        self.resource_definitions
            .keys()
            .chain(self.resources.keys())
            .chain(self.check_resources.keys())
            .cloned()
            .collect()
    }
}

/// Records pending update notifications and wakes the collector
///
/// All operations are safe to call concurrently.  Producers mutate the
/// pending bundle while holding the lock and notify after releasing it.
#[derive(Debug, Default)]
pub struct UpdateTracker {
    pending: Mutex<UpdateBundle>,
    notify: Notify,
}

impl UpdateTracker {
    pub fn new() -> UpdateTracker {
        UpdateTracker::default()
    }

    fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut UpdateBundle),
    {
        {
            let mut pending = self.pending.lock().unwrap();
            f(&mut pending);
        }
        self.notify.notify_waiters();
    }

    pub fn update_node(&self, name: NodeName, uuid: Uuid) {
        self.modify(|p| {
            p.nodes.insert(name, uuid);
        });
    }

    pub fn update_resource_definition(&self, name: ResourceName, uuid: Uuid) {
        self.modify(|p| {
            p.resource_definitions.insert(name, uuid);
        });
    }

    pub fn update_stor_pool(&self, name: StorPoolName, uuid: Uuid) {
        self.modify(|p| {
            p.stor_pools.insert(name, uuid);
        });
    }

    pub fn check_resource(&self, name: ResourceName, uuid: Uuid) {
        self.modify(|p| {
            p.check_resources.insert(name, uuid);
        });
    }

    /// Merges per-node instance UUIDs into the resource's pending entry
    ///
    /// An empty `nodes` map is ignored.
    pub fn update_resource(
        &self,
        name: ResourceName,
        nodes: BTreeMap<NodeName, Uuid>,
    ) {
        if nodes.is_empty() {
            return;
        }
        self.modify(|p| {
            p.resources.entry(name).or_default().extend(nodes);
        });
    }

    /// Wakes collectors without recording anything
    ///
    /// A collector woken this way finds nothing pending and keeps waiting.
    pub fn wake_collectors(&self) {
        self.notify.notify_waiters();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }

    /// Moves all pending notifications into `bundle`, waiting until there is
    /// at least one
    ///
    /// Returns `Err(ShutdownRequested)` without touching `bundle` once
    /// `shutdown` is set.  Cancel-safe: nothing is moved unless the future
    /// completes with `Ok`.
    pub async fn collect_update_notifications(
        &self,
        bundle: &mut UpdateBundle,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ShutdownRequested> {
        loop {
            // Register for wake-ups before looking at the predicate so that a
            // producer running between the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutdown::is_requested(shutdown) {
                return Err(ShutdownRequested);
            }
            if self.try_collect_update_notifications(bundle) {
                return Ok(());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown::requested(shutdown) => {
                    return Err(ShutdownRequested);
                }
            }
        }
    }

    /// Moves all pending notifications into `bundle` if there are any
    ///
    /// Returns whether anything was moved.
    pub fn try_collect_update_notifications(
        &self,
        bundle: &mut UpdateBundle,
    ) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if pending.is_empty() {
            return false;
        }
        bundle.absorb(std::mem::take(&mut *pending));
        true
    }

    /// Removes and returns the check-only entries
    pub fn take_check_resources(&self) -> BTreeMap<ResourceName, Uuid> {
        std::mem::take(&mut self.pending.lock().unwrap().check_resources)
    }

    pub fn forget_node(&self, name: &NodeName) {
        let mut pending = self.pending.lock().unwrap();
        pending.nodes.remove(name);
        for node_map in pending.resources.values_mut() {
            node_map.remove(name);
        }
        pending.resources.retain(|_, node_map| !node_map.is_empty());
    }

    /// Drops everything pending for the resource definition and all of its
    /// instances
    pub fn forget_resource_definition(&self, name: &ResourceName) {
        let mut pending = self.pending.lock().unwrap();
        pending.resource_definitions.remove(name);
        pending.check_resources.remove(name);
        pending.resources.remove(name);
    }

    pub fn forget_resource(&self, name: &ResourceName, node: &NodeName) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(node_map) = pending.resources.get_mut(name) {
            node_map.remove(node);
            if node_map.is_empty() {
                pending.resources.remove(name);
            }
        }
    }

    pub fn forget_stor_pool(&self, name: &StorPoolName) {
        self.pending.lock().unwrap().stor_pools.remove(name);
    }
}
