// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Multi-stage snapshot coordination
//!
//! Creating a snapshot registers a [`SnapshotDefinition`] in phase
//! [`SnapshotPhase::Proposed`] and marks every diskful instance of the
//! resource with an in-progress snapshot.  From there the snapshot moves
//! through the remaining phases: each time every participating node has
//! reported reaching the current phase, the definition advances, the change
//! is committed and the new resource state is pushed to the participants.
//!
//! | Advancing to   | Effect on the in-progress marks            |
//! |----------------|--------------------------------------------|
//! | `Suspending`   | `suspend_resource` set                     |
//! | `Snapshotting` | `take_snapshot` set                        |
//! | `Resuming`     | `suspend_resource` and `take_snapshot` cleared |
//! | `Cleanup`      | marks removed                              |
//! | `Committed`    | none                                       |
//!
//! A snapshot that is still in progress is aborted when one of its
//! participants disconnects.

use crate::datastore::{Changeset, Datastore, DatastoreError};
use crate::peer_registry::{ConnectionObserver, PeerRegistry, SatellitePeer};
use crate::satellite_updater::SatelliteUpdater;
use crate::state::{ClusterState, ResourceDefinition, Snapshot, SnapshotDefinition};
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use stormesh_common::access::{AccessContext, Privilege};
use stormesh_common::api::{ApiCallRc, ApiCallRcEntry, RcCode};
use stormesh_common::identity::{NodeName, ResourceName, SnapshotName};
use stormesh_common::messages::{
    InProgressSnapshotState, ResourceInstanceState, SnapshotPhase,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("resource definition {0} does not exist")]
    UnknownResourceDefinition(ResourceName),

    #[error("snapshot {snapshot} of resource {rsc} does not exist")]
    UnknownSnapshot { rsc: ResourceName, snapshot: SnapshotName },

    #[error("node {node} does not take part in snapshot {snapshot} of {rsc}")]
    NotParticipant {
        node: NodeName,
        rsc: ResourceName,
        snapshot: SnapshotName,
    },

    #[error("failed to commit snapshot {snapshot} of {rsc}")]
    Datastore {
        rsc: ResourceName,
        snapshot: SnapshotName,
        #[source]
        err: DatastoreError,
    },
}

pub struct SnapshotCoordinator {
    log: Logger,
    state: Arc<ClusterState>,
    datastore: Arc<dyn Datastore>,
    registry: Arc<PeerRegistry>,
    updater: Arc<SatelliteUpdater>,
}

fn entry(code: RcCode, message: impl Into<String>) -> ApiCallRcEntry {
    ApiCallRcEntry::new(code, message)
}

impl SnapshotCoordinator {
    pub fn new(
        log: &Logger,
        state: Arc<ClusterState>,
        datastore: Arc<dyn Datastore>,
        registry: Arc<PeerRegistry>,
        updater: Arc<SatelliteUpdater>,
    ) -> SnapshotCoordinator {
        SnapshotCoordinator {
            log: log.new(o!("component" => "SnapshotCoordinator")),
            state,
            datastore,
            registry,
            updater,
        }
    }

    /// Creates a snapshot of every diskful instance of `rsc_name`
    ///
    /// Either the whole snapshot is registered and committed, or nothing is
    /// changed and the result lists every reason it could not be.
    pub fn create_snapshot(
        &self,
        ctx: &AccessContext,
        rsc_name: &str,
        snapshot_name: &str,
    ) -> ApiCallRc {
        let (rsc, snapshot) =
            match self.parse_request(ctx, "create snapshot", rsc_name, snapshot_name)
            {
                Ok(names) => names,
                Err(rc) => return rc,
            };

        let result = self
            .state
            .update_resource_definition(&rsc, |rsc_dfn| {
                self.register_snapshot(rsc_dfn, &snapshot)
            })
            .unwrap_or_else(|| Err(rsc_dfn_not_found(&rsc)));

        match result {
            Ok(snapshot_dfn_uuid) => {
                info!(
                    self.log,
                    "registered snapshot";
                    "resource" => %rsc,
                    "snapshot" => %snapshot,
                    "uuid" => %snapshot_dfn_uuid,
                );
                self.updater.update_satellites(&rsc);
                ApiCallRc::single(
                    entry(
                        RcCode::Created,
                        format!(
                            "New snapshot '{snapshot}' of resource '{rsc}' \
                             registered."
                        ),
                    )
                    .with_object_ref("rsc_dfn", &rsc)
                    .with_object_ref("snapshot", &snapshot)
                    .with_object_ref("uuid", snapshot_dfn_uuid),
                )
            }
            Err(rc) => {
                info!(
                    self.log,
                    "snapshot not created";
                    "resource" => %rsc,
                    "snapshot" => %snapshot,
                    "codes" => ?rc.codes(),
                );
                rc
            }
        }
    }

    fn parse_request(
        &self,
        ctx: &AccessContext,
        action: &str,
        rsc_name: &str,
        snapshot_name: &str,
    ) -> Result<(ResourceName, SnapshotName), ApiCallRc> {
        ctx.require(Privilege::ObjChange, action).map_err(|err| {
            ApiCallRc::single(entry(RcCode::FailAccessDenied, err.to_string()))
        })?;
        let rsc = ResourceName::new(rsc_name).map_err(|err| {
            ApiCallRc::single(
                entry(
                    RcCode::FailInvalidName,
                    format!("Invalid resource name '{rsc_name}'."),
                )
                .with_cause(err.to_string()),
            )
        })?;
        let snapshot = SnapshotName::new(snapshot_name).map_err(|err| {
            ApiCallRc::single(
                entry(
                    RcCode::FailInvalidName,
                    format!("Invalid snapshot name '{snapshot_name}'."),
                )
                .with_cause(err.to_string()),
            )
        })?;
        Ok((rsc, snapshot))
    }

    fn register_snapshot(
        &self,
        rsc_dfn: &mut ResourceDefinition,
        snapshot: &SnapshotName,
    ) -> Result<Uuid, ApiCallRc> {
        if rsc_dfn.snapshot_dfns.contains_key(snapshot) {
            return Err(ApiCallRc::single(
                entry(
                    RcCode::FailExistsSnapshotDfn,
                    format!(
                        "A snapshot '{snapshot}' of resource '{}' already \
                         exists.",
                        rsc_dfn.name
                    ),
                )
                .with_object_ref("rsc_dfn", &rsc_dfn.name)
                .with_object_ref("snapshot", snapshot),
            ));
        }

        // Every instance is checked so that all problems are reported at
        // once.
        let mut failures = ApiCallRc::new();
        let mut participants = Vec::new();
        for (node, resource) in &rsc_dfn.resources {
            if resource.diskless {
                continue;
            }
            participants.push(node.clone());
            if let Some(failure) = self.check_drivers(&rsc_dfn.name, resource) {
                failures.add_entry(failure);
            }
            if !self.registry.is_connected(node) {
                failures.add_entry(
                    entry(
                        RcCode::FailNotConnected,
                        format!("No active connection to satellite '{node}'."),
                    )
                    .with_cause(
                        "Snapshots cannot be created when the corresponding \
                         satellites are not connected.",
                    )
                    .with_object_ref("node", node)
                    .with_object_ref("rsc_dfn", &rsc_dfn.name),
                );
            }
        }
        if failures.has_errors() {
            return Err(failures);
        }
        if participants.is_empty() {
            return Err(ApiCallRc::single(
                entry(
                    RcCode::FailNotFoundRsc,
                    "No resources found for snapshotting.",
                )
                .with_object_ref("rsc_dfn", &rsc_dfn.name),
            ));
        }

        let snapshot_dfn_uuid = Uuid::new_v4();
        let mut updated = rsc_dfn.clone();
        let mut snapshots = BTreeMap::new();
        for node in participants {
            let snapshot_uuid = Uuid::new_v4();
            if let Some(resource) = updated.resources.get_mut(&node) {
                resource.in_progress_snapshots.insert(
                    snapshot.clone(),
                    InProgressSnapshotState {
                        snapshot_name: snapshot.clone(),
                        snapshot_uuid,
                        snapshot_dfn_uuid,
                        suspend_resource: false,
                        take_snapshot: false,
                    },
                );
            }
            snapshots
                .insert(node.clone(), Snapshot { node, uuid: snapshot_uuid });
        }
        updated.snapshot_dfns.insert(
            snapshot.clone(),
            SnapshotDefinition {
                name: snapshot.clone(),
                uuid: snapshot_dfn_uuid,
                phase: SnapshotPhase::Proposed,
                snapshots,
                confirmations: BTreeSet::new(),
            },
        );

        self.commit(rsc_dfn, updated).map_err(|err| {
            ApiCallRc::single(
                entry(RcCode::FailDatastore, "Failed to store the snapshot.")
                    .with_cause(err.to_string())
                    .with_object_ref("rsc_dfn", &rsc_dfn.name)
                    .with_object_ref("snapshot", snapshot),
            )
        })?;
        Ok(snapshot_dfn_uuid)
    }

    /// Returns a failure if any volume of `resource` lives in a storage pool
    /// whose driver cannot take snapshots
    fn check_drivers(
        &self,
        rsc: &ResourceName,
        resource: &ResourceInstanceState,
    ) -> Option<ApiCallRcEntry> {
        for volume in &resource.volumes {
            let Some(pool) = self.state.stor_pool(&resource.node, &volume.stor_pool)
            else {
                error!(
                    self.log,
                    "volume refers to a storage pool that does not exist";
                    "resource" => %rsc,
                    "node" => %resource.node,
                    "stor_pool" => %volume.stor_pool,
                );
                return Some(
                    entry(
                        RcCode::FailImplementationError,
                        format!(
                            "Storage pool '{}' on '{}' does not exist.",
                            volume.stor_pool, resource.node
                        ),
                    )
                    .with_object_ref("node", &resource.node)
                    .with_object_ref("rsc_dfn", rsc),
                );
            };
            if !pool.driver.supports_snapshots() {
                return Some(
                    entry(
                        RcCode::FailSnapshotsNotSupported,
                        format!(
                            "Storage driver '{}' does not support snapshots.",
                            pool.driver
                        ),
                    )
                    .with_cause(format!(
                        "Used for storage pool '{}' on '{}'.",
                        pool.name, resource.node
                    ))
                    .with_object_ref("node", &resource.node)
                    .with_object_ref("rsc_dfn", rsc),
                );
            }
        }
        None
    }

    /// Records that `node` reached `phase` of a snapshot
    ///
    /// Returns the phase the snapshot advanced to, if this confirmation was
    /// the last one missing.  Confirmations for any phase other than the
    /// current one are stale and ignored.
    pub fn snapshot_phase_reached(
        &self,
        node: &NodeName,
        rsc: &ResourceName,
        snapshot: &SnapshotName,
        phase: SnapshotPhase,
    ) -> Result<Option<SnapshotPhase>, SnapshotError> {
        let advanced = self
            .state
            .update_resource_definition(rsc, |rsc_dfn| {
                self.record_confirmation(rsc_dfn, node, snapshot, phase)
            })
            .ok_or_else(|| SnapshotError::UnknownResourceDefinition(rsc.clone()))??;

        if let Some(next) = advanced {
            info!(
                self.log,
                "snapshot advanced";
                "resource" => %rsc,
                "snapshot" => %snapshot,
                "phase" => %next,
            );
            self.updater.update_satellites(rsc);
        }
        Ok(advanced)
    }

    fn record_confirmation(
        &self,
        rsc_dfn: &mut ResourceDefinition,
        node: &NodeName,
        snapshot: &SnapshotName,
        phase: SnapshotPhase,
    ) -> Result<Option<SnapshotPhase>, SnapshotError> {
        let unknown = || SnapshotError::UnknownSnapshot {
            rsc: rsc_dfn.name.clone(),
            snapshot: snapshot.clone(),
        };
        let snapshot_dfn =
            rsc_dfn.snapshot_dfns.get(snapshot).ok_or_else(unknown)?;
        if !snapshot_dfn.is_participant(node) {
            return Err(SnapshotError::NotParticipant {
                node: node.clone(),
                rsc: rsc_dfn.name.clone(),
                snapshot: snapshot.clone(),
            });
        }
        let Some(next) = snapshot_dfn.phase.next() else {
            debug!(
                self.log,
                "ignored confirmation for finished snapshot";
                "node" => %node,
                "snapshot" => %snapshot,
                "phase" => %snapshot_dfn.phase,
            );
            return Ok(None);
        };
        if snapshot_dfn.phase != phase {
            debug!(
                self.log,
                "ignored stale snapshot confirmation";
                "node" => %node,
                "snapshot" => %snapshot,
                "confirmed" => %phase,
                "current" => %snapshot_dfn.phase,
            );
            return Ok(None);
        }

        let mut confirmations = snapshot_dfn.confirmations.clone();
        confirmations.insert(node.clone());
        let all_confirmed =
            snapshot_dfn.snapshots.keys().all(|n| confirmations.contains(n));
        if !all_confirmed {
            // Confirmations are not persisted; a controller restart aborts
            // snapshots that are in progress anyway.
            if let Some(snapshot_dfn) = rsc_dfn.snapshot_dfns.get_mut(snapshot) {
                snapshot_dfn.confirmations = confirmations;
            }
            return Ok(None);
        }

        let mut updated = rsc_dfn.clone();
        set_phase(&mut updated, snapshot, next);
        self.commit(rsc_dfn, updated).map_err(|err| {
            SnapshotError::Datastore {
                rsc: rsc_dfn.name.clone(),
                snapshot: snapshot.clone(),
                err,
            }
        })?;
        Ok(Some(next))
    }

    /// Aborts a snapshot that is still in progress
    pub fn abort_snapshot(
        &self,
        ctx: &AccessContext,
        rsc_name: &str,
        snapshot_name: &str,
    ) -> ApiCallRc {
        let (rsc, snapshot) =
            match self.parse_request(ctx, "abort snapshot", rsc_name, snapshot_name)
            {
                Ok(names) => names,
                Err(rc) => return rc,
            };

        let result = self
            .state
            .update_resource_definition(&rsc, |rsc_dfn| {
                let Some(snapshot_dfn) = rsc_dfn.snapshot_dfns.get(&snapshot)
                else {
                    return Err(ApiCallRc::single(
                        entry(
                            RcCode::FailNotFoundSnapshotDfn,
                            format!(
                                "Snapshot '{snapshot}' of resource '{rsc}' not \
                                 found."
                            ),
                        )
                        .with_object_ref("rsc_dfn", &rsc)
                        .with_object_ref("snapshot", &snapshot),
                    ));
                };
                if !snapshot_dfn.phase.is_in_progress() {
                    return Err(ApiCallRc::single(
                        entry(
                            RcCode::FailInvalidSnapshotState,
                            format!(
                                "Snapshot '{snapshot}' of resource '{rsc}' is \
                                 already {}.",
                                snapshot_dfn.phase
                            ),
                        )
                        .with_object_ref("rsc_dfn", &rsc)
                        .with_object_ref("snapshot", &snapshot),
                    ));
                }
                self.abort_locked(rsc_dfn, &snapshot).map_err(|err| {
                    ApiCallRc::single(
                        entry(RcCode::FailDatastore, "Failed to abort the snapshot.")
                            .with_cause(format!("{err}"))
                            .with_object_ref("rsc_dfn", &rsc)
                            .with_object_ref("snapshot", &snapshot),
                    )
                })
            })
            .unwrap_or_else(|| Err(rsc_dfn_not_found(&rsc)));

        match result {
            Ok(()) => {
                warn!(
                    self.log,
                    "snapshot aborted";
                    "resource" => %rsc,
                    "snapshot" => %snapshot,
                );
                self.updater.update_satellites(&rsc);
                ApiCallRc::single(
                    entry(
                        RcCode::Modified,
                        format!("Snapshot '{snapshot}' of resource '{rsc}' aborted."),
                    )
                    .with_object_ref("rsc_dfn", &rsc)
                    .with_object_ref("snapshot", &snapshot),
                )
            }
            Err(rc) => rc,
        }
    }

    fn abort_locked(
        &self,
        rsc_dfn: &mut ResourceDefinition,
        snapshot: &SnapshotName,
    ) -> Result<(), DatastoreError> {
        let mut updated = rsc_dfn.clone();
        set_phase(&mut updated, snapshot, SnapshotPhase::Aborted);
        self.commit(rsc_dfn, updated)
    }

    /// Aborts every in-progress snapshot `node` takes part in
    fn abort_snapshots_on(&self, node: &NodeName) {
        for rsc in self.state.resource_definition_names() {
            let aborted = self
                .state
                .update_resource_definition(&rsc, |rsc_dfn| {
                    let affected: Vec<SnapshotName> = rsc_dfn
                        .snapshot_dfns
                        .values()
                        .filter(|s| s.phase.is_in_progress() && s.is_participant(node))
                        .map(|s| s.name.clone())
                        .collect();
                    let mut aborted = Vec::new();
                    for snapshot in affected {
                        match self.abort_locked(rsc_dfn, &snapshot) {
                            Ok(()) => aborted.push(snapshot),
                            Err(err) => error!(
                                self.log,
                                "failed to abort snapshot";
                                "resource" => %rsc_dfn.name,
                                "snapshot" => %snapshot,
                                "error" => %err,
                            ),
                        }
                    }
                    aborted
                })
                .unwrap_or_default();

            if aborted.is_empty() {
                continue;
            }
            for snapshot in &aborted {
                warn!(
                    self.log,
                    "aborted snapshot after a participant disconnected";
                    "node" => %node,
                    "resource" => %rsc,
                    "snapshot" => %snapshot,
                );
            }
            self.updater.update_satellites(&rsc);
        }
    }

    /// Commits `updated` and installs it in place of `rsc_dfn`
    fn commit(
        &self,
        rsc_dfn: &mut ResourceDefinition,
        updated: ResourceDefinition,
    ) -> Result<(), DatastoreError> {
        let changeset = Changeset::resource_definition(updated);
        if let Err(err) = self.datastore.commit(&changeset) {
            error!(
                self.log,
                "failed to commit resource definition";
                "resource" => %rsc_dfn.name,
                "error" => %err,
            );
            return Err(err);
        }
        if let Some(updated) = changeset.resource_definitions.into_iter().next() {
            *rsc_dfn = updated;
        }
        Ok(())
    }
}

impl ConnectionObserver for SnapshotCoordinator {
    fn on_connected(&self, _peer: &Arc<SatellitePeer>) {}

    fn on_disconnected(&self, node: &NodeName) {
        self.abort_snapshots_on(node);
    }
}

fn rsc_dfn_not_found(rsc: &ResourceName) -> ApiCallRc {
    ApiCallRc::single(
        entry(
            RcCode::FailNotFoundRscDfn,
            format!("Resource definition '{rsc}' not found."),
        )
        .with_object_ref("rsc_dfn", rsc),
    )
}

/// Moves `snapshot` to `phase` and updates the in-progress marks of its
/// participants to match
fn set_phase(
    rsc_dfn: &mut ResourceDefinition,
    snapshot: &SnapshotName,
    phase: SnapshotPhase,
) {
    let Some(snapshot_dfn) = rsc_dfn.snapshot_dfns.get_mut(snapshot) else {
        return;
    };
    snapshot_dfn.phase = phase;
    snapshot_dfn.confirmations.clear();
    let participants: Vec<NodeName> =
        snapshot_dfn.snapshots.keys().cloned().collect();

    for node in participants {
        let Some(resource) = rsc_dfn.resources.get_mut(&node) else {
            continue;
        };
        match phase {
            SnapshotPhase::Proposed => (),
            SnapshotPhase::Suspending => {
                if let Some(mark) = resource.in_progress_snapshots.get_mut(snapshot) {
                    mark.suspend_resource = true;
                }
            }
            SnapshotPhase::Snapshotting => {
                if let Some(mark) = resource.in_progress_snapshots.get_mut(snapshot) {
                    mark.take_snapshot = true;
                }
            }
            SnapshotPhase::Resuming => {
                if let Some(mark) = resource.in_progress_snapshots.get_mut(snapshot) {
                    mark.suspend_resource = false;
                    mark.take_snapshot = false;
                }
            }
            SnapshotPhase::Cleanup
            | SnapshotPhase::Committed
            | SnapshotPhase::Aborted => {
                resource.in_progress_snapshots.remove(snapshot);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::datastore::InMemoryDatastore;
    use assert_matches::assert_matches;
    use stormesh_common::identity::StorPoolName;
    use stormesh_common::messages::{
        ControllerMsg, NodeState, StorPoolState, StorageDriverKind,
        VolumeState,
    };
    use stormesh_common::serializer::JsonSerializer;
    use stormesh_test_utils::dev::peer::RecordingPeer;
    use stormesh_test_utils::dev::test_setup_log;

    struct Harness {
        state: Arc<ClusterState>,
        datastore: Arc<InMemoryDatastore>,
        registry: Arc<PeerRegistry>,
        coordinator: Arc<SnapshotCoordinator>,
        connections: BTreeMap<&'static str, Arc<RecordingPeer>>,
    }

    const NODES: [&str; 3] = ["node-a", "node-b", "node-c"];

    fn name(node: &str) -> NodeName {
        NodeName::new(node).unwrap()
    }

    fn rsc_a() -> ResourceName {
        ResourceName::new("rscA").unwrap()
    }

    fn snap1() -> SnapshotName {
        SnapshotName::new("snap1").unwrap()
    }

    fn system_ctx() -> AccessContext {
        let mut ctx = AccessContext::system();
        ctx.enable_privileges([Privilege::SysAll]).unwrap();
        ctx
    }

    fn user_ctx() -> AccessContext {
        let mut ctx = AccessContext::new(
            "admin",
            [Privilege::ObjView, Privilege::ObjChange],
        );
        ctx.enable_privileges([Privilege::ObjView, Privilege::ObjChange])
            .unwrap();
        ctx
    }

    /// Every node has a thin LVM pool "thin" and a thick LVM pool "thick";
    /// a satellite is connected for each of them
    fn setup(log: &Logger) -> Harness {
        let state = Arc::new(ClusterState::new());
        for node in NODES {
            state.put_node(NodeState { name: name(node), uuid: Uuid::new_v4() });
            for (pool, driver) in [
                ("thin", StorageDriverKind::LvmThin),
                ("thick", StorageDriverKind::Lvm),
            ] {
                state.put_stor_pool(StorPoolState {
                    name: StorPoolName::new(pool).unwrap(),
                    uuid: Uuid::new_v4(),
                    node: name(node),
                    driver,
                });
            }
        }

        let registry = Arc::new(PeerRegistry::new(log));
        let updater = Arc::new(SatelliteUpdater::new(
            log,
            system_ctx(),
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::new(JsonSerializer),
        ));
        let datastore = Arc::new(InMemoryDatastore::new());
        let coordinator = Arc::new(SnapshotCoordinator::new(
            log,
            Arc::clone(&state),
            datastore.clone(),
            Arc::clone(&registry),
            updater,
        ));
        registry.register_observer(&coordinator);

        let mut connections = BTreeMap::new();
        for node in NODES {
            let connection = Arc::new(RecordingPeer::new(node));
            registry.connect(name(node), connection.clone());
            connections.insert(node, connection);
        }
        Harness { state, datastore, registry, coordinator, connections }
    }

    /// Adds rscA with one instance per `(node, pool)`; a `None` pool makes
    /// the instance diskless
    fn add_rsc_a(harness: &Harness, instances: &[(&str, Option<&str>)]) {
        let mut rsc_dfn = ResourceDefinition::new(rsc_a(), Uuid::new_v4());
        for (node, pool) in instances {
            rsc_dfn.add_resource(ResourceInstanceState {
                node: name(node),
                uuid: Uuid::new_v4(),
                diskless: pool.is_none(),
                volumes: pool
                    .map(|pool| VolumeState {
                        number: 0,
                        stor_pool: StorPoolName::new(pool).unwrap(),
                    })
                    .into_iter()
                    .collect(),
                in_progress_snapshots: BTreeMap::new(),
            });
        }
        harness.state.put_resource_definition(rsc_dfn);
    }

    fn assert_untouched(harness: &Harness) {
        let rsc_dfn = harness.state.resource_definition(&rsc_a()).unwrap();
        assert!(rsc_dfn.snapshot_dfns.is_empty());
        assert!(rsc_dfn
            .resources
            .values()
            .all(|r| r.in_progress_snapshots.is_empty()));
        assert_eq!(harness.datastore.commit_count(), 0);
        assert!(harness.connections.values().all(|c| c.sent_count() == 0));
    }

    #[test]
    fn test_unsupported_driver_blocks_creation() {
        let logctx = test_setup_log("test_unsupported_driver_blocks_creation");
        let harness = setup(&logctx.log);
        add_rsc_a(&harness, &[("node-a", Some("thin")), ("node-b", Some("thick"))]);

        let rc = harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::FailSnapshotsNotSupported]);
        assert_eq!(rc.entries()[0].object_refs["node"], "node-b");
        assert_untouched(&harness);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_every_disconnected_instance_is_reported() {
        let logctx = test_setup_log("test_every_disconnected_instance_is_reported");
        let harness = setup(&logctx.log);
        add_rsc_a(
            &harness,
            &[
                ("node-a", Some("thin")),
                ("node-b", Some("thin")),
                ("node-c", Some("thin")),
            ],
        );
        harness.connections["node-b"].set_connected(false);
        harness.connections["node-c"].set_connected(false);

        let rc = harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::FailNotConnected, RcCode::FailNotConnected]);
        assert_untouched(&harness);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_create_snapshot() {
        let logctx = test_setup_log("test_create_snapshot");
        let harness = setup(&logctx.log);
        add_rsc_a(
            &harness,
            &[("node-a", Some("thin")), ("node-b", Some("thin")), ("node-c", None)],
        );

        let rc = harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::Created]);
        assert_eq!(harness.datastore.commit_count(), 1);

        let rsc_dfn = harness.state.resource_definition(&rsc_a()).unwrap();
        let snapshot_dfn = &rsc_dfn.snapshot_dfns[&snap1()];
        assert_eq!(snapshot_dfn.phase, SnapshotPhase::Proposed);
        assert_eq!(
            snapshot_dfn.snapshots.keys().cloned().collect::<Vec<_>>(),
            [name("node-a"), name("node-b")]
        );
        for node in ["node-a", "node-b"] {
            let mark = &rsc_dfn.resources[&name(node)].in_progress_snapshots[&snap1()];
            assert_eq!(mark.snapshot_dfn_uuid, snapshot_dfn.uuid);
            assert_eq!(mark.snapshot_uuid, snapshot_dfn.snapshots[&name(node)].uuid);
            assert!(!mark.suspend_resource);

            let sent = harness.connections[node].sent_controller_msgs();
            assert_matches!(
                &sent[..],
                [ControllerMsg::ApplyResource { resource, .. }]
                    if resource.local.in_progress_snapshots.contains_key(&snap1())
            );
        }
        // The diskless instance holds no data.
        assert!(rsc_dfn.resources[&name("node-c")]
            .in_progress_snapshots
            .is_empty());
        assert_eq!(harness.datastore.commits()[0].resource_definitions[0], rsc_dfn);

        let rc = harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::FailExistsSnapshotDfn]);
        assert_eq!(harness.datastore.commit_count(), 1);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_create_snapshot_rejections() {
        let logctx = test_setup_log("test_create_snapshot_rejections");
        let harness = setup(&logctx.log);
        add_rsc_a(&harness, &[("node-a", None)]);
        let ctx = user_ctx();

        let cases = [
            ("rscZ", "snap1", RcCode::FailNotFoundRscDfn),
            ("rscA", "snap1", RcCode::FailNotFoundRsc),
            ("-bad", "snap1", RcCode::FailInvalidName),
            ("rscA", "1bad", RcCode::FailInvalidName),
        ];
        for (rsc, snapshot, code) in cases {
            let rc = harness.coordinator.create_snapshot(&ctx, rsc, snapshot);
            assert_eq!(rc.codes(), [code], "{rsc}/{snapshot}");
        }

        let rc = harness.coordinator.create_snapshot(
            &AccessContext::public(),
            "rscA",
            "snap1",
        );
        assert_eq!(rc.codes(), [RcCode::FailAccessDenied]);
        assert_untouched(&harness);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_datastore_failure_changes_nothing() {
        let logctx = test_setup_log("test_datastore_failure_changes_nothing");
        let harness = setup(&logctx.log);
        add_rsc_a(&harness, &[("node-a", Some("thin"))]);
        harness.datastore.set_fail_commits(true);

        let rc = harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::FailDatastore]);
        assert_untouched(&harness);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_phases_advance_on_confirmation() {
        let logctx = test_setup_log("test_phases_advance_on_confirmation");
        let harness = setup(&logctx.log);
        add_rsc_a(&harness, &[("node-a", Some("thin")), ("node-b", Some("thin"))]);
        let rc = harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        assert!(!rc.has_errors());

        let confirm = |node: &str, phase| {
            harness
                .coordinator
                .snapshot_phase_reached(&name(node), &rsc_a(), &snap1(), phase)
                .unwrap()
        };
        let mark = |node: &str| {
            harness
                .state
                .resource_definition(&rsc_a())
                .unwrap()
                .resources[&name(node)]
                .in_progress_snapshots
                .get(&snap1())
                .cloned()
        };

        assert_eq!(confirm("node-a", SnapshotPhase::Proposed), None);
        // Stale confirmations do not count.
        assert_eq!(confirm("node-b", SnapshotPhase::Suspending), None);
        assert_eq!(
            confirm("node-b", SnapshotPhase::Proposed),
            Some(SnapshotPhase::Suspending)
        );
        assert!(mark("node-a").unwrap().suspend_resource);
        assert!(!mark("node-a").unwrap().take_snapshot);

        confirm("node-a", SnapshotPhase::Suspending);
        assert_eq!(
            confirm("node-b", SnapshotPhase::Suspending),
            Some(SnapshotPhase::Snapshotting)
        );
        assert!(mark("node-b").unwrap().take_snapshot);

        confirm("node-a", SnapshotPhase::Snapshotting);
        confirm("node-b", SnapshotPhase::Snapshotting);
        let resumed = mark("node-a").unwrap();
        assert!(!resumed.suspend_resource);
        assert!(!resumed.take_snapshot);

        confirm("node-a", SnapshotPhase::Resuming);
        assert_eq!(
            confirm("node-b", SnapshotPhase::Resuming),
            Some(SnapshotPhase::Cleanup)
        );
        assert!(mark("node-a").is_none());
        assert!(mark("node-b").is_none());

        confirm("node-a", SnapshotPhase::Cleanup);
        assert_eq!(
            confirm("node-b", SnapshotPhase::Cleanup),
            Some(SnapshotPhase::Committed)
        );
        assert_eq!(confirm("node-a", SnapshotPhase::Committed), None);

        // One commit to create, one per advance.
        assert_eq!(harness.datastore.commit_count(), 6);
        assert_matches!(
            harness.coordinator.snapshot_phase_reached(
                &name("node-c"),
                &rsc_a(),
                &snap1(),
                SnapshotPhase::Committed
            ),
            Err(SnapshotError::NotParticipant { .. })
        );
        logctx.cleanup_successful();
    }

    #[test]
    fn test_disconnect_aborts_snapshot() {
        let logctx = test_setup_log("test_disconnect_aborts_snapshot");
        let harness = setup(&logctx.log);
        add_rsc_a(&harness, &[("node-a", Some("thin")), ("node-b", Some("thin"))]);
        harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");
        harness.connections["node-a"].clear();

        harness.registry.disconnect(&name("node-b"));

        let rsc_dfn = harness.state.resource_definition(&rsc_a()).unwrap();
        assert_eq!(rsc_dfn.snapshot_dfns[&snap1()].phase, SnapshotPhase::Aborted);
        assert!(rsc_dfn
            .resources
            .values()
            .all(|r| r.in_progress_snapshots.is_empty()));
        // The remaining participant learns about the abort.
        assert_eq!(harness.connections["node-a"].sent_count(), 1);
        logctx.cleanup_successful();
    }

    #[test]
    fn test_abort_snapshot() {
        let logctx = test_setup_log("test_abort_snapshot");
        let harness = setup(&logctx.log);
        add_rsc_a(&harness, &[("node-a", Some("thin"))]);
        harness.coordinator.create_snapshot(&user_ctx(), "rscA", "snap1");

        let ctx = user_ctx();
        let rc = harness.coordinator.abort_snapshot(&ctx, "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::Modified]);
        let rc = harness.coordinator.abort_snapshot(&ctx, "rscA", "snap1");
        assert_eq!(rc.codes(), [RcCode::FailInvalidSnapshotState]);
        let rc = harness.coordinator.abort_snapshot(&ctx, "rscA", "snap2");
        assert_eq!(rc.codes(), [RcCode::FailNotFoundSnapshotDfn]);
        assert_eq!(harness.datastore.commit_count(), 2);
        logctx.cleanup_successful();
    }
}
