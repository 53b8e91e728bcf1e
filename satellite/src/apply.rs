// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application of controller messages to the satellite's local state
//!
//! A full sync is applied only if its id is at least the one the satellite is
//! expecting; stale ones are ignored.  Incremental updates are accepted
//! once a full sync was applied on the current connection and are applied
//! strictly in update id order, buffering any that arrive early.  An
//! incremental update that contradicts a locally known object (same name,
//! different UUID) is rejected and marks the connection as desynchronized:
//! nothing else is applied until the next full sync.

use crate::device_manager::{AppliedUpdates, DeviceManagerHandle};
use crate::state::SatelliteState;
use crate::update_requester::UpdateRequester;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use stormesh_common::identity::{NodeName, ResourceName};
use stormesh_common::messages::{
    ControllerMsg, FullSyncPayload, InProgressSnapshotState, NodeState,
    ResourceState, StorPoolState,
};
use stormesh_common::peer::PeerConnection;
use stormesh_common::record::{check_uuid, DivergenceError, EntityKind};
use stormesh_common::serializer::{MessageSerializer, SerializeError};
use stormesh_common::sync::{FullSyncId, UpdateId};

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to decode controller message")]
    Decode(#[from] SerializeError),

    /// The connection must be treated as desynchronized
    #[error(transparent)]
    Divergence(#[from] DivergenceError),

    #[error("full sync {full_sync_id} could not be applied: {reason}")]
    FullSyncFailed { full_sync_id: FullSyncId, reason: String },

    #[error("update {update_id} was received more than once")]
    DuplicateUpdate { update_id: UpdateId },

    #[error("incremental update carries no update id")]
    MissingUpdateId,

    #[error("resource {rsc} is not known to this satellite")]
    UnknownResource { rsc: ResourceName },

    #[error("resource {rsc} describes an instance on node {node}")]
    ForeignResource { rsc: ResourceName, node: NodeName },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    /// The message, and `updates` messages in total including buffered ones,
    /// were applied
    Applied { updates: usize },
    /// The message arrived ahead of its predecessors and was buffered
    Buffered,
    /// The message is a stale full sync, or an incremental update received
    /// while no full sync is in effect
    IgnoredOutdated,
}

#[derive(Debug)]
struct MonitorState {
    expected_full_sync_id: FullSyncId,
    applied_full_sync_id: Option<FullSyncId>,
    awaited_update_id: UpdateId,
}

/// Sequencing state of the connection to the controller
#[derive(Debug)]
pub struct UpdateMonitor {
    state: Mutex<MonitorState>,
}

impl Default for UpdateMonitor {
    fn default() -> Self {
        UpdateMonitor::expecting(FullSyncId::initial())
    }
}

impl UpdateMonitor {
    pub fn new() -> UpdateMonitor {
        UpdateMonitor::default()
    }

    /// A monitor waiting for the full sync with id `full_sync_id`
    pub fn expecting(full_sync_id: FullSyncId) -> UpdateMonitor {
        UpdateMonitor {
            state: Mutex::new(MonitorState {
                expected_full_sync_id: full_sync_id,
                applied_full_sync_id: None,
                awaited_update_id: UpdateId::initial(),
            }),
        }
    }

    /// The lowest full sync id that will be accepted next
    ///
    /// Full syncs with a lower id were superseded and are ignored.
    pub fn current_full_sync_id(&self) -> FullSyncId {
        self.state.lock().unwrap().expected_full_sync_id
    }

    /// The full sync whose incremental updates are currently accepted
    pub fn applied_full_sync_id(&self) -> Option<FullSyncId> {
        self.state.lock().unwrap().applied_full_sync_id
    }

    pub fn is_full_sync_applied(&self) -> bool {
        self.applied_full_sync_id().is_some()
    }

    pub fn awaited_update_id(&self) -> UpdateId {
        self.state.lock().unwrap().awaited_update_id
    }

    fn set_full_sync_applied(&self, full_sync_id: FullSyncId) {
        let mut state = self.state.lock().unwrap();
        state.applied_full_sync_id = Some(full_sync_id);
        state.expected_full_sync_id = full_sync_id.next();
        state.awaited_update_id = UpdateId::initial();
    }

    fn set_full_sync_failed(&self, full_sync_id: FullSyncId) {
        let mut state = self.state.lock().unwrap();
        state.expected_full_sync_id = full_sync_id.next();
        state.applied_full_sync_id = None;
    }

    /// Forgets everything about the previous connection
    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.expected_full_sync_id = FullSyncId::initial();
        state.applied_full_sync_id = None;
        state.awaited_update_id = UpdateId::initial();
    }

    fn set_desynchronized(&self) {
        self.state.lock().unwrap().applied_full_sync_id = None;
    }

    fn advance_awaited_update_id(&self) {
        let mut state = self.state.lock().unwrap();
        state.awaited_update_id = state.awaited_update_id.next();
    }
}

/// Applies controller messages and reports what was applied to the device
/// manager
pub struct UpdateApplier {
    log: Logger,
    state: Arc<SatelliteState>,
    device_manager: DeviceManagerHandle,
    monitor: Arc<UpdateMonitor>,
    requester: UpdateRequester,
    serializer: Arc<dyn MessageSerializer>,
    /// Incremental updates that arrived ahead of the awaited one
    buffered: Mutex<BTreeMap<UpdateId, ControllerMsg>>,
}

impl UpdateApplier {
    pub fn new(
        log: &Logger,
        state: Arc<SatelliteState>,
        device_manager: DeviceManagerHandle,
        monitor: Arc<UpdateMonitor>,
        requester: UpdateRequester,
        serializer: Arc<dyn MessageSerializer>,
    ) -> UpdateApplier {
        UpdateApplier {
            log: log.new(o!("component" => "UpdateApplier")),
            state,
            device_manager,
            monitor,
            requester,
            serializer,
            buffered: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn monitor(&self) -> &Arc<UpdateMonitor> {
        &self.monitor
    }

    /// Starts over on a new connection to the controller
    ///
    /// Sequencing restarts from scratch: the controller on the other end may
    /// have been restarted and number its full syncs from the first id again.
    /// Incremental updates are ignored until a full sync was applied on the
    /// new connection.
    pub fn controller_connected(&self, peer: Arc<dyn PeerConnection>) {
        let mut buffered = self.buffered.lock().unwrap();
        buffered.clear();
        self.monitor.reset();
        drop(buffered);

        info!(
            self.log,
            "controller connected; waiting for a full sync";
            "connection" => peer.id(),
        );
        self.requester.connector().set_controller_peer(peer);
    }

    /// Decodes and applies one message received from the controller
    pub fn handle_message(
        &self,
        bytes: &[u8],
    ) -> Result<ApplyOutcome, ApplyError> {
        let msg = self.serializer.decode_controller_msg(bytes)?;
        self.apply(msg)
    }

    pub fn apply(&self, msg: ControllerMsg) -> Result<ApplyOutcome, ApplyError> {
        match msg {
            ControllerMsg::FullSync { header, payload } => {
                self.apply_full_sync(header.full_sync_id, payload)
            }
            msg => self.apply_incremental(msg),
        }
    }

    fn apply_full_sync(
        &self,
        full_sync_id: FullSyncId,
        payload: FullSyncPayload,
    ) -> Result<ApplyOutcome, ApplyError> {
        let expected = self.monitor.current_full_sync_id();
        if full_sync_id < expected {
            info!(
                self.log,
                "ignored outdated full sync";
                "full_sync_id" => %full_sync_id,
                "expected" => %expected,
            );
            return Ok(ApplyOutcome::IgnoredOutdated);
        }

        if let Err(reason) = self.validate_full_sync(&payload) {
            error!(
                self.log,
                "full sync failed";
                "full_sync_id" => %full_sync_id,
                "reason" => &reason,
            );
            // The controller decides how to recover; whatever it sent after
            // this full sync is outdated now.
            if let Err(err) = self.requester.notify_full_sync_failed(full_sync_id)
            {
                warn!(
                    self.log,
                    "failed to report full sync failure to the controller";
                    "full_sync_id" => %full_sync_id,
                    "error" => %err,
                );
            }
            self.monitor.set_full_sync_failed(full_sync_id);
            return Err(ApplyError::FullSyncFailed { full_sync_id, reason });
        }

        let counts = (
            payload.nodes.len(),
            payload.stor_pools.len(),
            payload.resources.len(),
        );
        let mut buffered = self.buffered.lock().unwrap();
        buffered.clear();
        self.state.replace_all(payload);
        self.monitor.set_full_sync_applied(full_sync_id);
        drop(buffered);

        info!(
            self.log,
            "applied full sync";
            "full_sync_id" => %full_sync_id,
            "nodes" => counts.0,
            "stor_pools" => counts.1,
            "resources" => counts.2,
        );
        self.device_manager.full_sync_applied();
        Ok(ApplyOutcome::Applied { updates: 1 })
    }

    fn validate_full_sync(&self, payload: &FullSyncPayload) -> Result<(), String> {
        let local_node = self.state.local_node();
        let mut seen = BTreeSet::new();
        for rsc in &payload.resources {
            if rsc.local.node != *local_node {
                return Err(format!(
                    "resource {} describes an instance on node {}",
                    rsc.name(),
                    rsc.local.node,
                ));
            }
            if !seen.insert(rsc.name().clone()) {
                return Err(format!("resource {} appears twice", rsc.name()));
            }
        }
        for pool in &payload.stor_pools {
            if pool.node != *local_node {
                return Err(format!(
                    "storage pool {} belongs to node {}",
                    pool.name, pool.node,
                ));
            }
        }
        Ok(())
    }

    fn apply_incremental(
        &self,
        msg: ControllerMsg,
    ) -> Result<ApplyOutcome, ApplyError> {
        let header = *msg.header();
        if !self.monitor.is_full_sync_applied() {
            debug!(
                self.log,
                "ignored update received before a full sync was applied";
                "message" => msg.kind(),
                "update_id" => %header.update_id,
            );
            return Ok(ApplyOutcome::IgnoredOutdated);
        }
        if !header.update_id.is_incremental() {
            return Err(ApplyError::MissingUpdateId);
        }

        let mut buffered = self.buffered.lock().unwrap();
        let awaited = self.monitor.awaited_update_id();
        if header.update_id < awaited
            || buffered.contains_key(&header.update_id)
        {
            error!(
                self.log,
                "received an update more than once";
                "update_id" => %header.update_id,
                "awaited" => %awaited,
            );
            return Err(ApplyError::DuplicateUpdate {
                update_id: header.update_id,
            });
        }
        buffered.insert(header.update_id, msg);

        let mut applied = 0;
        loop {
            let awaited = self.monitor.awaited_update_id();
            let Some(msg) = buffered.remove(&awaited) else {
                break;
            };
            self.monitor.advance_awaited_update_id();
            let kind = msg.kind();
            match self.apply_one(msg) {
                Ok(()) => applied += 1,
                Err(ApplyError::Divergence(err)) => {
                    error!(
                        self.log,
                        "local state diverged from the controller";
                        "update_id" => %awaited,
                        "error" => %err,
                    );
                    buffered.clear();
                    self.monitor.set_desynchronized();
                    return Err(ApplyError::Divergence(err));
                }
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to apply update";
                        "message" => kind,
                        "update_id" => %awaited,
                        "error" => %err,
                    );
                }
            }
        }

        if applied == 0 && !buffered.is_empty() {
            Ok(ApplyOutcome::Buffered)
        } else {
            Ok(ApplyOutcome::Applied { updates: applied })
        }
    }

    fn apply_one(&self, msg: ControllerMsg) -> Result<(), ApplyError> {
        match msg {
            ControllerMsg::FullSync { .. } => {
                unreachable!("full syncs are not sequenced by update id")
            }
            ControllerMsg::ApplyNode { node, .. } => self.apply_node(node),
            ControllerMsg::ApplyDeletedNode { node, .. } => {
                self.state.remove_node(&node);
                info!(self.log, "node removed by the controller"; "node" => %node);
                self.device_manager.node_deleted(&node);
                Ok(())
            }
            ControllerMsg::ApplyResource { resource, .. } => {
                self.apply_resource(resource)
            }
            ControllerMsg::ApplyDeletedResource { rsc, .. } => {
                self.apply_deleted_resource(rsc);
                Ok(())
            }
            ControllerMsg::ApplyStorPool { stor_pool, .. } => {
                self.apply_stor_pool(stor_pool)
            }
            ControllerMsg::ApplyDeletedStorPool { stor_pool, .. } => {
                self.state.remove_stor_pool(&stor_pool);
                info!(
                    self.log,
                    "storage pool removed by the controller";
                    "stor_pool" => %stor_pool,
                );
                self.device_manager.stor_pool_deleted(&stor_pool);
                Ok(())
            }
            ControllerMsg::ApplyInProgressSnapshot { rsc, snapshot, .. } => {
                self.apply_in_progress_snapshot(rsc, snapshot)
            }
        }
    }

    fn apply_node(&self, node: NodeState) -> Result<(), ApplyError> {
        if let Some(local) = self.state.node(&node.name) {
            check_uuid(EntityKind::Node, &node.name, local.uuid, node.uuid)?;
        }
        let name = node.name.clone();
        self.state.put_node(node);
        self.device_manager.node_update_applied([name]);
        Ok(())
    }

    fn apply_stor_pool(&self, pool: StorPoolState) -> Result<(), ApplyError> {
        if let Some(local) = self.state.stor_pool(&pool.name) {
            check_uuid(EntityKind::StorPool, &pool.name, local.uuid, pool.uuid)?;
        }
        let name = pool.name.clone();
        self.state.put_stor_pool(pool);
        self.device_manager.stor_pool_update_applied([name]);
        Ok(())
    }

    fn apply_resource(&self, resource: ResourceState) -> Result<(), ApplyError> {
        let name = resource.name().clone();
        if resource.local.node != *self.state.local_node() {
            return Err(ApplyError::ForeignResource {
                rsc: name,
                node: resource.local.node,
            });
        }
        if let Some(local) = self.state.resource(&name) {
            local
                .definition
                .check_divergence(EntityKind::ResourceDefinition, &resource.definition)?;
            check_uuid(
                EntityKind::Resource,
                &name,
                local.local.uuid,
                resource.local.uuid,
            )?;
        }

        // The message carries the resource as a whole, so it answers every
        // outstanding request for any of its instances.
        let mut nodes: BTreeSet<NodeName> = self
            .device_manager
            .pending_confirmations()
            .resources
            .get(&name)
            .map(|node_map| node_map.keys().cloned().collect())
            .unwrap_or_default();
        nodes.insert(resource.local.node.clone());
        nodes.extend(resource.peers.iter().map(|peer| peer.node.clone()));

        let dfn_uuid = resource.definition.uuid;
        self.state.put_resource(resource);
        self.device_manager.update_applied(AppliedUpdates {
            resource_definitions: BTreeSet::from([name.clone()]),
            resources: BTreeMap::from([(name.clone(), nodes)]),
            ..Default::default()
        });
        self.device_manager.update_tracker().check_resource(name, dfn_uuid);
        Ok(())
    }

    /// Marks `rsc` as deleted and schedules its teardown
    ///
    /// The resource stays known as deleted until the device handlers of a
    /// cycle ran for it; the device manager forgets it afterwards.
    fn apply_deleted_resource(&self, rsc: ResourceName) {
        let deleted = self.state.mark_resource_deleted(&rsc);
        info!(
            self.log,
            "resource removed by the controller";
            "resource" => %rsc,
            "known" => deleted.is_some(),
        );
        self.device_manager.resource_definition_deleted(&rsc);
        if let Some(resource) = deleted {
            self.device_manager
                .update_tracker()
                .check_resource(rsc, resource.definition.uuid);
        }
    }

    fn apply_in_progress_snapshot(
        &self,
        rsc: ResourceName,
        snapshot: InProgressSnapshotState,
    ) -> Result<(), ApplyError> {
        let dfn_uuid = self
            .state
            .update_resource(&rsc, |resource| {
                if let Some(local) =
                    resource.local.in_progress_snapshots.get(&snapshot.snapshot_name)
                {
                    check_uuid(
                        EntityKind::Snapshot,
                        &snapshot.snapshot_name,
                        local.snapshot_uuid,
                        snapshot.snapshot_uuid,
                    )?;
                }
                resource
                    .local
                    .in_progress_snapshots
                    .insert(snapshot.snapshot_name.clone(), snapshot);
                Ok::<_, DivergenceError>(resource.definition.uuid)
            })
            .ok_or_else(|| ApplyError::UnknownResource { rsc: rsc.clone() })??;
        self.device_manager.update_tracker().check_resource(rsc, dfn_uuid);
        Ok(())
    }
}
