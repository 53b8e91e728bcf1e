// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Snapshots driven through their phases by satellite confirmations

use super::cluster::{user_ctx, TestCluster};
use stormesh_common::api::RcCode;
use stormesh_common::identity::{ResourceName, SnapshotName};
use stormesh_common::messages::{InProgressSnapshotState, SnapshotPhase};
use stormesh_satellite::apply::ApplyOutcome;
use stormesh_test_utils::dev::test_setup_log;

const NODES: [&str; 2] = ["node-a", "node-b"];

fn rsc_a() -> ResourceName {
    ResourceName::new("rscA").unwrap()
}

fn snap1() -> SnapshotName {
    SnapshotName::new("snap1").unwrap()
}

/// Connects every satellite and waits for the dispatch that follows its full
/// sync
async fn start_cluster(cluster: &mut TestCluster) {
    for node in NODES {
        cluster.connect(node);
        let satellite = cluster.satellite(node);
        assert_eq!(
            satellite.receive().unwrap(),
            ApplyOutcome::Applied { updates: 1 }
        );
        satellite.wait_for_dispatches(1).await;
    }
}

/// Applies the next controller message on `node` and returns the snapshot
/// mark the device handler saw when it ran for the `dispatches`th time
async fn next_mark(
    cluster: &mut TestCluster,
    node: &str,
    dispatches: usize,
) -> Option<InProgressSnapshotState> {
    let satellite = cluster.satellite(node);
    assert_eq!(satellite.receive().unwrap(), ApplyOutcome::Applied { updates: 1 });
    let dispatched = satellite.wait_for_dispatches(dispatches).await;
    dispatched[dispatches - 1].local.in_progress_snapshots.get(&snap1()).cloned()
}

fn phase(cluster: &TestCluster) -> SnapshotPhase {
    cluster.state.resource_definition(&rsc_a()).unwrap().snapshot_dfns[&snap1()]
        .phase
}

#[tokio::test]
async fn test_snapshot_lifecycle() {
    let logctx = test_setup_log("test_snapshot_lifecycle");
    let mut cluster = TestCluster::new(&logctx.log, &NODES);
    cluster.add_resource("rscA", &NODES);
    start_cluster(&mut cluster).await;

    let rc = cluster.snapshots.create_snapshot(&user_ctx(), "rscA", "snap1");
    assert_eq!(rc.codes(), [RcCode::Created]);
    for node in NODES {
        let mark = next_mark(&mut cluster, node, 2).await.unwrap();
        assert!(!mark.suspend_resource);
        assert!(!mark.take_snapshot);
    }

    // (phase confirmed, (suspend_resource, take_snapshot) afterwards)
    let steps = [
        (SnapshotPhase::Proposed, Some((true, false))),
        (SnapshotPhase::Suspending, Some((true, true))),
        (SnapshotPhase::Snapshotting, Some((false, false))),
        (SnapshotPhase::Resuming, None),
        (SnapshotPhase::Cleanup, None),
    ];
    for (i, (confirmed, expected)) in steps.into_iter().enumerate() {
        for node in NODES {
            cluster
                .satellite(node)
                .requester
                .notify_snapshot_phase_reached(&rsc_a(), &snap1(), confirmed)
                .unwrap();
            assert_eq!(cluster.deliver_to_controller(node), 1);
        }
        assert_eq!(Some(phase(&cluster)), confirmed.next());

        for node in NODES {
            let mark = next_mark(&mut cluster, node, 3 + i).await;
            assert_eq!(
                mark.map(|m| (m.suspend_resource, m.take_snapshot)),
                expected,
                "{node} after confirming {confirmed}"
            );
        }
    }

    assert_eq!(phase(&cluster), SnapshotPhase::Committed);
    // One commit to create the snapshot, one per phase advance.
    assert_eq!(cluster.datastore.commit_count(), 6);

    cluster.shutdown();
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_disconnect_aborts_snapshot() {
    let logctx = test_setup_log("test_disconnect_aborts_snapshot");
    let mut cluster = TestCluster::new(&logctx.log, &NODES);
    cluster.add_resource("rscA", &NODES);
    start_cluster(&mut cluster).await;

    let rc = cluster.snapshots.create_snapshot(&user_ctx(), "rscA", "snap1");
    assert_eq!(rc.codes(), [RcCode::Created]);
    for node in NODES {
        assert!(next_mark(&mut cluster, node, 2).await.is_some());
    }

    cluster.disconnect("node-b");
    assert_eq!(phase(&cluster), SnapshotPhase::Aborted);
    assert!(next_mark(&mut cluster, "node-a", 3).await.is_none());

    // Late confirmations for the aborted snapshot change nothing.
    cluster
        .satellite("node-a")
        .requester
        .notify_snapshot_phase_reached(&rsc_a(), &snap1(), SnapshotPhase::Proposed)
        .unwrap();
    cluster.deliver_to_controller("node-a");
    assert_eq!(phase(&cluster), SnapshotPhase::Aborted);
    assert!(cluster.satellite("node-a").try_receive().is_none());

    let rc = cluster.snapshots.create_snapshot(&user_ctx(), "rscA", "snap2");
    assert_eq!(rc.codes(), [RcCode::FailNotConnected]);

    cluster.shutdown();
    logctx.cleanup_successful();
}
