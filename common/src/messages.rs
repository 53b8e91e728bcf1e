// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Messages exchanged between the controller and its satellites
//!
//! These types describe message semantics.  How they are laid out on the wire
//! is decided by a [`crate::serializer::MessageSerializer`].

use crate::identity::{NodeName, ResourceName, SnapshotName, StorPoolName};
use crate::record::EntityRecord;
use crate::sync::{FullSyncId, SyncHeader};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// The driver backing a storage pool
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum StorageDriverKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
}

impl StorageDriverKind {
    pub fn supports_snapshots(&self) -> bool {
        match self {
            StorageDriverKind::LvmThin
            | StorageDriverKind::Zfs
            | StorageDriverKind::ZfsThin => true,
            StorageDriverKind::Diskless | StorageDriverKind::Lvm => false,
        }
    }
}

impl fmt::Display for StorageDriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageDriverKind::Diskless => "diskless",
            StorageDriverKind::Lvm => "lvm",
            StorageDriverKind::LvmThin => "lvm-thin",
            StorageDriverKind::Zfs => "zfs",
            StorageDriverKind::ZfsThin => "zfs-thin",
        };
        f.write_str(s)
    }
}

/// Phase of a cluster-wide snapshot
///
/// A snapshot moves through the in-progress phases in order, each advance
/// requiring every participating node to confirm the current phase, and ends
/// either `Committed` or `Aborted`.
#[derive(
    Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum SnapshotPhase {
    Proposed,
    Suspending,
    Snapshotting,
    Resuming,
    Cleanup,
    Committed,
    Aborted,
}

impl SnapshotPhase {
    /// The phase that follows this one, or `None` for terminal phases
    pub fn next(&self) -> Option<SnapshotPhase> {
        match self {
            SnapshotPhase::Proposed => Some(SnapshotPhase::Suspending),
            SnapshotPhase::Suspending => Some(SnapshotPhase::Snapshotting),
            SnapshotPhase::Snapshotting => Some(SnapshotPhase::Resuming),
            SnapshotPhase::Resuming => Some(SnapshotPhase::Cleanup),
            SnapshotPhase::Cleanup => Some(SnapshotPhase::Committed),
            SnapshotPhase::Committed | SnapshotPhase::Aborted => None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.next().is_some()
    }
}

impl fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NodeState {
    pub name: NodeName,
    pub uuid: Uuid,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StorPoolState {
    pub name: StorPoolName,
    pub uuid: Uuid,
    pub node: NodeName,
    pub driver: StorageDriverKind,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeState {
    pub number: u32,
    pub stor_pool: StorPoolName,
}

/// Per-resource mark of a snapshot that is still being taken
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InProgressSnapshotState {
    pub snapshot_name: SnapshotName,
    pub snapshot_uuid: Uuid,
    pub snapshot_dfn_uuid: Uuid,
    /// I/O to the resource must be suspended
    pub suspend_resource: bool,
    /// The satellite must take the snapshot of its volumes
    pub take_snapshot: bool,
}

/// One node's instance of a resource
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceInstanceState {
    pub node: NodeName,
    pub uuid: Uuid,
    pub diskless: bool,
    pub volumes: Vec<VolumeState>,
    pub in_progress_snapshots: BTreeMap<SnapshotName, InProgressSnapshotState>,
}

/// A resource as seen by one satellite: the definition, the satellite's own
/// instance and the instances on its peer nodes
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ResourceState {
    pub definition: EntityRecord<ResourceName>,
    pub local: ResourceInstanceState,
    pub peers: Vec<ResourceInstanceState>,
}

impl ResourceState {
    pub fn name(&self) -> &ResourceName {
        &self.definition.name
    }
}

/// Everything a satellite needs to know, shipped as one message
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FullSyncPayload {
    pub nodes: Vec<NodeState>,
    pub stor_pools: Vec<StorPoolState>,
    pub resources: Vec<ResourceState>,
}

/// Messages sent by a satellite to the controller
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SatelliteMsg {
    RequestNode {
        node: NodeName,
        uuid: Uuid,
    },
    RequestResourceDefinition {
        rsc: ResourceName,
        uuid: Uuid,
    },
    RequestResource {
        node: NodeName,
        rsc: ResourceName,
        uuid: Uuid,
    },
    RequestStorPool {
        stor_pool: StorPoolName,
        uuid: Uuid,
    },
    RequestInProgressSnapshot {
        rsc: ResourceName,
        snapshot: SnapshotName,
        snapshot_uuid: Uuid,
    },
    /// The sending node has completed the given snapshot phase
    SnapshotPhaseReached {
        rsc: ResourceName,
        snapshot: SnapshotName,
        phase: SnapshotPhase,
    },
    /// The satellite could not apply the full sync with the given id
    FullSyncFailed {
        full_sync_id: FullSyncId,
    },
}

/// Messages sent by the controller to a satellite
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerMsg {
    FullSync {
        header: SyncHeader,
        payload: FullSyncPayload,
    },
    ApplyNode {
        header: SyncHeader,
        node: NodeState,
    },
    ApplyDeletedNode {
        header: SyncHeader,
        node: NodeName,
    },
    ApplyResource {
        header: SyncHeader,
        resource: ResourceState,
    },
    ApplyDeletedResource {
        header: SyncHeader,
        rsc: ResourceName,
    },
    ApplyStorPool {
        header: SyncHeader,
        stor_pool: StorPoolState,
    },
    ApplyDeletedStorPool {
        header: SyncHeader,
        stor_pool: StorPoolName,
    },
    ApplyInProgressSnapshot {
        header: SyncHeader,
        rsc: ResourceName,
        snapshot: InProgressSnapshotState,
    },
}

impl ControllerMsg {
    pub fn header(&self) -> &SyncHeader {
        match self {
            ControllerMsg::FullSync { header, .. }
            | ControllerMsg::ApplyNode { header, .. }
            | ControllerMsg::ApplyDeletedNode { header, .. }
            | ControllerMsg::ApplyResource { header, .. }
            | ControllerMsg::ApplyDeletedResource { header, .. }
            | ControllerMsg::ApplyStorPool { header, .. }
            | ControllerMsg::ApplyDeletedStorPool { header, .. }
            | ControllerMsg::ApplyInProgressSnapshot { header, .. } => header,
        }
    }

    /// Short label for log messages
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMsg::FullSync { .. } => "full_sync",
            ControllerMsg::ApplyNode { .. } => "apply_node",
            ControllerMsg::ApplyDeletedNode { .. } => "apply_deleted_node",
            ControllerMsg::ApplyResource { .. } => "apply_resource",
            ControllerMsg::ApplyDeletedResource { .. } => {
                "apply_deleted_resource"
            }
            ControllerMsg::ApplyStorPool { .. } => "apply_stor_pool",
            ControllerMsg::ApplyDeletedStorPool { .. } => {
                "apply_deleted_stor_pool"
            }
            ControllerMsg::ApplyInProgressSnapshot { .. } => {
                "apply_in_progress_snapshot"
            }
        }
    }
}

impl SatelliteMsg {
    /// Short label for log messages
    pub fn kind(&self) -> &'static str {
        match self {
            SatelliteMsg::RequestNode { .. } => "request_node",
            SatelliteMsg::RequestResourceDefinition { .. } => {
                "request_resource_definition"
            }
            SatelliteMsg::RequestResource { .. } => "request_resource",
            SatelliteMsg::RequestStorPool { .. } => "request_stor_pool",
            SatelliteMsg::RequestInProgressSnapshot { .. } => {
                "request_in_progress_snapshot"
            }
            SatelliteMsg::SnapshotPhaseReached { .. } => {
                "snapshot_phase_reached"
            }
            SatelliteMsg::FullSyncFailed { .. } => "full_sync_failed",
        }
    }
}
