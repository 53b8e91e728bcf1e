// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The satellite's local copy of the objects the controller shared with it
//!
//! Each map has its own lock.  Apply handlers are the only writers, except
//! that the device manager drops deleted resources once their devices were
//! torn down.  The resources lock is always taken before the deleted
//! resources lock.

use std::collections::BTreeMap;
use std::sync::RwLock;
use stormesh_common::identity::{NodeName, ResourceName, StorPoolName};
use stormesh_common::messages::{
    FullSyncPayload, NodeState, ResourceState, StorPoolState,
};

#[derive(Debug)]
pub struct SatelliteState {
    local_node: NodeName,
    nodes: RwLock<BTreeMap<NodeName, NodeState>>,
    stor_pools: RwLock<BTreeMap<StorPoolName, StorPoolState>>,
    resources: RwLock<BTreeMap<ResourceName, ResourceState>>,
    /// Resources the controller deleted whose devices were not torn down yet
    deleted_resources: RwLock<BTreeMap<ResourceName, ResourceState>>,
}

impl SatelliteState {
    pub fn new(local_node: NodeName) -> SatelliteState {
        SatelliteState {
            local_node,
            nodes: RwLock::new(BTreeMap::new()),
            stor_pools: RwLock::new(BTreeMap::new()),
            resources: RwLock::new(BTreeMap::new()),
            deleted_resources: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn local_node(&self) -> &NodeName {
        &self.local_node
    }

    pub fn node(&self, name: &NodeName) -> Option<NodeState> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn put_node(&self, node: NodeState) {
        self.nodes.write().unwrap().insert(node.name.clone(), node);
    }

    pub fn remove_node(&self, name: &NodeName) -> Option<NodeState> {
        self.nodes.write().unwrap().remove(name)
    }

    pub fn stor_pool(&self, name: &StorPoolName) -> Option<StorPoolState> {
        self.stor_pools.read().unwrap().get(name).cloned()
    }

    pub fn put_stor_pool(&self, pool: StorPoolState) {
        self.stor_pools.write().unwrap().insert(pool.name.clone(), pool);
    }

    pub fn remove_stor_pool(
        &self,
        name: &StorPoolName,
    ) -> Option<StorPoolState> {
        self.stor_pools.write().unwrap().remove(name)
    }

    pub fn resource(&self, name: &ResourceName) -> Option<ResourceState> {
        self.resources.read().unwrap().get(name).cloned()
    }

    pub fn put_resource(&self, resource: ResourceState) {
        let name = resource.name().clone();
        let mut resources = self.resources.write().unwrap();
        self.deleted_resources.write().unwrap().remove(&name);
        resources.insert(name, resource);
    }

    /// Modifies a known resource in place
    ///
    /// Returns `None` if the resource is not known.
    pub fn update_resource<F, T>(&self, name: &ResourceName, f: F) -> Option<T>
    where
        F: FnOnce(&mut ResourceState) -> T,
    {
        self.resources.write().unwrap().get_mut(name).map(f)
    }

    /// Moves a known resource to the deleted resources
    ///
    /// Returns the deleted resource, or `None` if it was not known.
    pub fn mark_resource_deleted(
        &self,
        name: &ResourceName,
    ) -> Option<ResourceState> {
        let mut resources = self.resources.write().unwrap();
        let resource = resources.remove(name)?;
        self.deleted_resources
            .write()
            .unwrap()
            .insert(name.clone(), resource.clone());
        Some(resource)
    }

    pub fn deleted_resource(&self, name: &ResourceName) -> Option<ResourceState> {
        self.deleted_resources.read().unwrap().get(name).cloned()
    }

    pub fn deleted_resource_names(&self) -> Vec<ResourceName> {
        self.deleted_resources.read().unwrap().keys().cloned().collect()
    }

    /// Drops a deleted resource once its devices were torn down
    pub fn forget_deleted_resource(
        &self,
        name: &ResourceName,
    ) -> Option<ResourceState> {
        self.deleted_resources.write().unwrap().remove(name)
    }

    pub fn resource_names(&self) -> Vec<ResourceName> {
        self.resources.read().unwrap().keys().cloned().collect()
    }

    pub fn node_names(&self) -> Vec<NodeName> {
        self.nodes.read().unwrap().keys().cloned().collect()
    }

    pub fn stor_pool_names(&self) -> Vec<StorPoolName> {
        self.stor_pools.read().unwrap().keys().cloned().collect()
    }

    /// Replaces everything with the contents of a full sync
    ///
    /// Deleted resources that are not part of the full sync stay scheduled
    /// for teardown.
    pub fn replace_all(&self, payload: FullSyncPayload) {
        let nodes =
            payload.nodes.into_iter().map(|n| (n.name.clone(), n)).collect();
        let stor_pools = payload
            .stor_pools
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        let resources = payload
            .resources
            .into_iter()
            .map(|r| (r.name().clone(), r))
            .collect::<BTreeMap<_, _>>();
        *self.nodes.write().unwrap() = nodes;
        *self.stor_pools.write().unwrap() = stor_pools;
        let mut current = self.resources.write().unwrap();
        self.deleted_resources
            .write()
            .unwrap()
            .retain(|name, _| !resources.contains_key(name));
        *current = resources;
    }
}
