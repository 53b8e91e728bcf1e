// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller's authoritative cluster state
//!
//! Each map has its own lock.  The node and storage pool maps may be read
//! while the resource definition lock is held for writing, never the other
//! way around.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use stormesh_common::identity::{
    NodeName, ResourceName, SnapshotName, StorPoolName,
};
use stormesh_common::messages::{
    NodeState, ResourceInstanceState, ResourceState, SnapshotPhase,
    StorPoolState,
};
use stormesh_common::record::EntityRecord;
use uuid::Uuid;

/// One node's snapshot of a resource
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    pub node: NodeName,
    pub uuid: Uuid,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SnapshotDefinition {
    pub name: SnapshotName,
    pub uuid: Uuid,
    pub phase: SnapshotPhase,
    /// One snapshot per participating node
    pub snapshots: BTreeMap<NodeName, Snapshot>,
    /// Participants that reached the current phase
    pub confirmations: BTreeSet<NodeName>,
}

impl SnapshotDefinition {
    pub fn is_participant(&self, node: &NodeName) -> bool {
        self.snapshots.contains_key(node)
    }

    /// Every participant confirmed the current phase
    pub fn all_confirmed(&self) -> bool {
        self.snapshots.keys().all(|node| self.confirmations.contains(node))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResourceDefinition {
    pub name: ResourceName,
    pub uuid: Uuid,
    pub resources: BTreeMap<NodeName, ResourceInstanceState>,
    pub snapshot_dfns: BTreeMap<SnapshotName, SnapshotDefinition>,
}

impl ResourceDefinition {
    pub fn new(name: ResourceName, uuid: Uuid) -> ResourceDefinition {
        ResourceDefinition {
            name,
            uuid,
            resources: BTreeMap::new(),
            snapshot_dfns: BTreeMap::new(),
        }
    }

    pub fn add_resource(&mut self, resource: ResourceInstanceState) {
        self.resources.insert(resource.node.clone(), resource);
    }

    pub fn record(&self) -> EntityRecord<ResourceName> {
        EntityRecord::new(self.name.clone(), self.uuid)
    }

    /// The resource as seen by the satellite on `node`
    ///
    /// Returns `None` if `node` hosts no instance of this resource.
    pub fn state_for(&self, node: &NodeName) -> Option<ResourceState> {
        let local = self.resources.get(node)?.clone();
        let peers = self
            .resources
            .iter()
            .filter(|(peer, _)| *peer != node)
            .map(|(_, resource)| resource.clone())
            .collect();
        Some(ResourceState { definition: self.record(), local, peers })
    }
}

#[derive(Debug, Default)]
pub struct ClusterState {
    nodes: RwLock<BTreeMap<NodeName, NodeState>>,
    stor_pools: RwLock<BTreeMap<(NodeName, StorPoolName), StorPoolState>>,
    resource_definitions: RwLock<BTreeMap<ResourceName, ResourceDefinition>>,
}

impl ClusterState {
    pub fn new() -> ClusterState {
        ClusterState::default()
    }

    pub fn put_node(&self, node: NodeState) {
        self.nodes.write().unwrap().insert(node.name.clone(), node);
    }

    pub fn node(&self, name: &NodeName) -> Option<NodeState> {
        self.nodes.read().unwrap().get(name).cloned()
    }

    pub fn remove_node(&self, name: &NodeName) -> Option<NodeState> {
        self.nodes.write().unwrap().remove(name)
    }

    pub fn put_stor_pool(&self, pool: StorPoolState) {
        self.stor_pools
            .write()
            .unwrap()
            .insert((pool.node.clone(), pool.name.clone()), pool);
    }

    pub fn stor_pool(
        &self,
        node: &NodeName,
        name: &StorPoolName,
    ) -> Option<StorPoolState> {
        self.stor_pools
            .read()
            .unwrap()
            .get(&(node.clone(), name.clone()))
            .cloned()
    }

    /// Every storage pool on `node`, whether or not any volume uses it
    pub fn stor_pools_on(&self, node: &NodeName) -> Vec<StorPoolState> {
        self.stor_pools
            .read()
            .unwrap()
            .values()
            .filter(|pool| pool.node == *node)
            .cloned()
            .collect()
    }

    pub fn remove_stor_pool(
        &self,
        node: &NodeName,
        name: &StorPoolName,
    ) -> Option<StorPoolState> {
        self.stor_pools
            .write()
            .unwrap()
            .remove(&(node.clone(), name.clone()))
    }

    pub fn put_resource_definition(&self, rsc_dfn: ResourceDefinition) {
        self.resource_definitions
            .write()
            .unwrap()
            .insert(rsc_dfn.name.clone(), rsc_dfn);
    }

    pub fn resource_definition(
        &self,
        name: &ResourceName,
    ) -> Option<ResourceDefinition> {
        self.resource_definitions.read().unwrap().get(name).cloned()
    }

    /// Modifies a resource definition in place
    ///
    /// Returns `None` if the resource definition does not exist.
    pub fn update_resource_definition<F, T>(
        &self,
        name: &ResourceName,
        f: F,
    ) -> Option<T>
    where
        F: FnOnce(&mut ResourceDefinition) -> T,
    {
        self.resource_definitions.write().unwrap().get_mut(name).map(f)
    }

    pub fn remove_resource_definition(
        &self,
        name: &ResourceName,
    ) -> Option<ResourceDefinition> {
        self.resource_definitions.write().unwrap().remove(name)
    }

    pub fn resource_definition_names(&self) -> Vec<ResourceName> {
        self.resource_definitions.read().unwrap().keys().cloned().collect()
    }

    /// Resource definitions with an instance on `node`
    pub fn resource_definitions_on(
        &self,
        node: &NodeName,
    ) -> Vec<ResourceDefinition> {
        self.resource_definitions
            .read()
            .unwrap()
            .values()
            .filter(|rsc_dfn| rsc_dfn.resources.contains_key(node))
            .cloned()
            .collect()
    }

    /// The resource `rsc` as seen by the satellite on `node`
    pub fn resource_state_for(
        &self,
        node: &NodeName,
        rsc: &ResourceName,
    ) -> Option<ResourceState> {
        self.resource_definitions
            .read()
            .unwrap()
            .get(rsc)
            .and_then(|rsc_dfn| rsc_dfn.state_for(node))
    }
}
