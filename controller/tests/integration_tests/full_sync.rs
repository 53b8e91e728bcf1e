// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Full syncs and incremental updates between the controller and satellites

use super::cluster::{name, TestCluster};
use assert_matches::assert_matches;
use stormesh_common::identity::ResourceName;
use stormesh_common::record::DivergenceError;
use stormesh_common::sync::FullSyncId;
use stormesh_controller::state::ResourceDefinition;
use stormesh_satellite::apply::{ApplyError, ApplyOutcome};
use stormesh_test_utils::dev::test_setup_log;
use uuid::Uuid;

fn rsc(name: &str) -> ResourceName {
    ResourceName::new(name).unwrap()
}

#[tokio::test]
async fn test_full_sync_dispatches_local_resources() {
    let logctx = test_setup_log("test_full_sync_dispatches_local_resources");
    let mut cluster = TestCluster::new(&logctx.log, &["node-a", "node-b"]);
    cluster.add_resource("rscA", &["node-a", "node-b"]);
    cluster.add_resource("rscB", &["node-b"]);

    cluster.connect("node-a");
    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert_eq!(satellite.state.resource_names(), [rsc("rscA")]);
    assert_eq!(satellite.state.node_names(), [name("node-a"), name("node-b")]);
    assert_eq!(
        satellite.applier.monitor().applied_full_sync_id(),
        Some(FullSyncId::initial())
    );

    let dispatched = satellite.wait_for_dispatches(1).await;
    assert_eq!(dispatched[0].name(), &rsc("rscA"));
    assert_eq!(dispatched[0].peers[0].node, name("node-b"));

    cluster.shutdown();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_reconnect_supersedes_lost_full_sync() {
    let logctx = test_setup_log("test_reconnect_supersedes_lost_full_sync");
    let mut cluster = TestCluster::new(&logctx.log, &["node-a"]);
    cluster.add_resource("rscA", &["node-a"]);

    // The first full sync never arrives.
    cluster.connect("node-a");
    cluster.disconnect("node-a");
    cluster.connect("node-a");
    let peer = cluster.registry.peer(&name("node-a")).unwrap();
    assert_eq!(peer.full_sync_id(), FullSyncId::from_raw(2));

    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert_eq!(
        satellite.applier.monitor().applied_full_sync_id(),
        Some(FullSyncId::from_raw(2))
    );

    // Incremental updates restart at the first update id after every full
    // sync.
    assert_eq!(cluster.updater.update_satellites(&rsc("rscA")), 0);
    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });

    cluster.disconnect("node-a");
    cluster.connect("node-a");
    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert_eq!(
        satellite.applier.monitor().applied_full_sync_id(),
        Some(FullSyncId::from_raw(3))
    );
    assert_eq!(cluster.updater.update_satellites(&rsc("rscA")), 0);
    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });

    cluster.shutdown();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_update_requests_are_answered() {
    let logctx = test_setup_log("test_update_requests_are_answered");
    let mut cluster = TestCluster::new(&logctx.log, &["node-a", "node-b"]);
    cluster.add_resource("rscA", &["node-a", "node-b"]);
    cluster.connect("node-a");
    cluster.satellite("node-a").receive().unwrap();

    // node-b leaves the cluster; the satellite asks about it and learns that
    // it is gone.
    let node_b = cluster.state.node(&name("node-b")).unwrap();
    cluster.state.remove_node(&node_b.name);
    cluster
        .satellite("node-a")
        .requester
        .request_node_update(&node_b.name, node_b.uuid)
        .unwrap();
    let local = cluster.state.resource_state_for(&name("node-a"), &rsc("rscA")).unwrap();
    cluster
        .satellite("node-a")
        .requester
        .request_resource_update(&name("node-a"), &rsc("rscA"), local.local.uuid)
        .unwrap();
    assert_eq!(cluster.deliver_to_controller("node-a"), 2);

    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert_eq!(satellite.state.node_names(), [name("node-a")]);
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert!(satellite.try_receive().is_none());

    cluster.shutdown();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_divergence_is_resolved_by_full_sync() {
    let logctx = test_setup_log("test_divergence_is_resolved_by_full_sync");
    let mut cluster = TestCluster::new(&logctx.log, &["node-a"]);
    cluster.add_resource("rscA", &["node-a"]);
    cluster.connect("node-a");
    cluster.satellite("node-a").receive().unwrap();

    // rscA is deleted and created again while the satellite still knows the
    // old one.
    let old = cluster.state.remove_resource_definition(&rsc("rscA")).unwrap();
    let mut new = ResourceDefinition::new(old.name.clone(), Uuid::new_v4());
    for resource in old.resources.into_values() {
        new.add_resource(resource);
    }
    let new_uuid = new.uuid;
    cluster.state.put_resource_definition(new);
    cluster.updater.update_satellites(&rsc("rscA"));

    let satellite = cluster.satellite("node-a");
    assert_matches!(
        satellite.receive(),
        Err(ApplyError::Divergence(DivergenceError { .. }))
    );
    assert!(!satellite.applier.monitor().is_full_sync_applied());
    assert_eq!(
        satellite.state.resource(&rsc("rscA")).unwrap().definition.uuid,
        old.uuid
    );

    // Further updates are ignored until the next full sync.
    cluster.updater.update_satellites(&rsc("rscA"));
    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::IgnoredOutdated);

    cluster.disconnect("node-a");
    cluster.connect("node-a");
    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert_eq!(
        satellite.state.resource(&rsc("rscA")).unwrap().definition.uuid,
        new_uuid
    );

    cluster.shutdown();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_deleted_resource_is_torn_down() {
    let logctx = test_setup_log("test_deleted_resource_is_torn_down");
    let mut cluster = TestCluster::new(&logctx.log, &["node-a"]);
    cluster.add_resource("rscA", &["node-a"]);
    cluster.connect("node-a");
    let satellite = cluster.satellite("node-a");
    satellite.receive().unwrap();
    satellite.wait_for_dispatches(1).await;

    let local =
        cluster.state.resource_state_for(&name("node-a"), &rsc("rscA")).unwrap();
    cluster.state.remove_resource_definition(&rsc("rscA")).unwrap();
    cluster
        .satellite("node-a")
        .requester
        .request_resource_update(&name("node-a"), &rsc("rscA"), local.local.uuid)
        .unwrap();
    assert_eq!(cluster.deliver_to_controller("node-a"), 1);

    let satellite = cluster.satellite("node-a");
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    assert!(satellite.state.resource_names().is_empty());
    assert_eq!(satellite.wait_for_deletions(1).await, [rsc("rscA")]);
    assert_eq!(satellite.handler.dispatched().len(), 1);

    cluster.shutdown();
    logctx.cleanup_successful();
}
