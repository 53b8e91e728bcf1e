// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A controller wired to in-process satellites
//!
//! Messages travel over [`ChannelPeer`]s.  Nothing is delivered on its own:
//! tests move each message across explicitly, which keeps the order of
//! events under their control.

use slog::Logger;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stormesh_common::access::{AccessContext, Privilege};
use stormesh_common::identity::{NodeName, ResourceName, StorPoolName};
use stormesh_common::messages::{
    NodeState, ResourceInstanceState, ResourceState, StorPoolState,
    StorageDriverKind, VolumeState,
};
use stormesh_common::serializer::{JsonSerializer, MessageSerializer};
use stormesh_controller::datastore::InMemoryDatastore;
use stormesh_controller::full_sync::FullSyncCoordinator;
use stormesh_controller::inbound::InboundHandler;
use stormesh_controller::peer_registry::PeerRegistry;
use stormesh_controller::satellite_updater::SatelliteUpdater;
use stormesh_controller::snapshot::SnapshotCoordinator;
use stormesh_controller::state::{ClusterState, ResourceDefinition};
use stormesh_satellite::apply::{ApplyError, ApplyOutcome, UpdateApplier, UpdateMonitor};
use stormesh_satellite::config::DeviceManagerConfig;
use stormesh_satellite::controller_peer::ControllerPeerConnector;
use stormesh_satellite::device_handler::DeviceHandler;
use stormesh_satellite::device_manager::{self, DeviceManagerHandle};
use stormesh_satellite::state::SatelliteState;
use stormesh_satellite::update_requester::UpdateRequester;
use stormesh_satellite::update_tracker::UpdateTracker;
use stormesh_test_utils::dev::peer::ChannelPeer;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Name of the storage pool every test node has
pub const THIN_POOL: &str = "thin";

pub fn name(node: &str) -> NodeName {
    NodeName::new(node).unwrap()
}

pub fn system_ctx() -> AccessContext {
    let mut ctx = AccessContext::system();
    ctx.enable_privileges([Privilege::SysAll]).unwrap();
    ctx
}

pub fn user_ctx() -> AccessContext {
    let privileges = [Privilege::ObjView, Privilege::ObjChange];
    let mut ctx = AccessContext::new("admin", privileges);
    ctx.enable_privileges(privileges).unwrap();
    ctx
}

/// Remembers every resource it was dispatched for or asked to delete
#[derive(Default)]
pub struct RecordingHandler {
    dispatched: Mutex<Vec<ResourceState>>,
    deleted: Mutex<Vec<ResourceName>>,
}

impl RecordingHandler {
    pub fn dispatched(&self) -> Vec<ResourceState> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<ResourceName> {
        self.deleted.lock().unwrap().clone()
    }
}

impl DeviceHandler for RecordingHandler {
    async fn dispatch_resource(
        &self,
        resource: ResourceState,
    ) -> anyhow::Result<()> {
        self.dispatched.lock().unwrap().push(resource);
        Ok(())
    }

    async fn delete_resource(
        &self,
        resource: ResourceState,
    ) -> anyhow::Result<()> {
        self.deleted.lock().unwrap().push(resource.name().clone());
        Ok(())
    }
}

pub struct TestSatellite {
    pub state: Arc<SatelliteState>,
    pub applier: UpdateApplier,
    pub device_manager: DeviceManagerHandle,
    pub handler: Arc<RecordingHandler>,
    pub requester: UpdateRequester,
    /// The satellite's end of every connection
    to_controller: Arc<ChannelPeer>,
    /// Messages sent to the controller
    outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Messages sent by the controller over the current connection
    inbox: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// The controller's end of the current connection
    connection: Option<Arc<ChannelPeer>>,
}

impl TestSatellite {
    fn start(log: &Logger, node: &NodeName) -> TestSatellite {
        let log = log.new(slog::o!("satellite" => node.to_string()));
        let state = Arc::new(SatelliteState::new(node.clone()));
        let connector = Arc::new(ControllerPeerConnector::new(node.clone()));
        let (to_controller, outbox) =
            ChannelPeer::new(format!("{node}-to-controller"));
        let serializer: Arc<dyn MessageSerializer> = Arc::new(JsonSerializer);
        let requester = UpdateRequester::new(
            &log,
            system_ctx(),
            connector,
            Arc::clone(&serializer),
        );
        let handler = Arc::new(RecordingHandler::default());
        let device_manager = device_manager::spawn(
            &log,
            &DeviceManagerConfig::default(),
            AccessContext::system(),
            Arc::new(UpdateTracker::new()),
            Arc::clone(&state),
            requester.clone(),
            Arc::clone(&handler),
        );
        device_manager.device_state_available();
        let applier = UpdateApplier::new(
            &log,
            Arc::clone(&state),
            device_manager.clone(),
            Arc::new(UpdateMonitor::new()),
            requester.clone(),
            serializer,
        );
        TestSatellite {
            state,
            applier,
            device_manager,
            handler,
            requester,
            to_controller: Arc::new(to_controller),
            outbox,
            inbox: None,
            connection: None,
        }
    }

    /// Applies the next message the controller sent, if there is one
    pub fn try_receive(&mut self) -> Option<Result<ApplyOutcome, ApplyError>> {
        let bytes = self.inbox.as_mut()?.try_recv().ok()?;
        Some(self.applier.handle_message(&bytes))
    }

    /// Applies the next message the controller sent
    ///
    /// Panics if there is none.
    pub fn receive(&mut self) -> Result<ApplyOutcome, ApplyError> {
        self.try_receive().expect("controller sent a message")
    }

    /// Waits until the device handler ran `count` times in total
    pub async fn wait_for_dispatches(&self, count: usize) -> Vec<ResourceState> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let dispatched = self.handler.dispatched();
                if dispatched.len() >= count {
                    return dispatched;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device handler was dispatched")
    }

    /// Waits until the device handler tore down `count` resources in total
    pub async fn wait_for_deletions(&self, count: usize) -> Vec<ResourceName> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let deleted = self.handler.deleted();
                if deleted.len() >= count {
                    return deleted;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("device handler deleted resources")
    }
}

pub struct TestCluster {
    pub state: Arc<ClusterState>,
    pub datastore: Arc<InMemoryDatastore>,
    pub registry: Arc<PeerRegistry>,
    pub updater: Arc<SatelliteUpdater>,
    pub snapshots: Arc<SnapshotCoordinator>,
    pub inbound: InboundHandler,
    pub satellites: BTreeMap<NodeName, TestSatellite>,
    // Observers are only weakly referenced by the registry.
    _full_sync: Arc<FullSyncCoordinator>,
}

impl TestCluster {
    /// Creates the controller and one satellite per node
    ///
    /// Each node gets a thin LVM storage pool.  No satellite is connected
    /// yet.
    pub fn new(log: &Logger, nodes: &[&str]) -> TestCluster {
        let state = Arc::new(ClusterState::new());
        let serializer: Arc<dyn MessageSerializer> = Arc::new(JsonSerializer);
        let registry = Arc::new(PeerRegistry::new(log));
        let datastore = Arc::new(InMemoryDatastore::new());
        let full_sync = Arc::new(FullSyncCoordinator::new(
            log,
            system_ctx(),
            Arc::clone(&state),
            Arc::clone(&serializer),
        ));
        let updater = Arc::new(SatelliteUpdater::new(
            log,
            system_ctx(),
            Arc::clone(&state),
            Arc::clone(&registry),
            Arc::clone(&serializer),
        ));
        let snapshots = Arc::new(SnapshotCoordinator::new(
            log,
            Arc::clone(&state),
            datastore.clone(),
            Arc::clone(&registry),
            Arc::clone(&updater),
        ));
        registry.register_observer(&full_sync);
        registry.register_observer(&snapshots);
        let inbound = InboundHandler::new(
            log,
            Arc::clone(&registry),
            Arc::clone(&updater),
            Arc::clone(&snapshots),
            serializer,
        );

        let mut satellites = BTreeMap::new();
        for node in nodes {
            let node = name(node);
            state.put_node(NodeState { name: node.clone(), uuid: Uuid::new_v4() });
            state.put_stor_pool(StorPoolState {
                name: StorPoolName::new(THIN_POOL).unwrap(),
                uuid: Uuid::new_v4(),
                node: node.clone(),
                driver: StorageDriverKind::LvmThin,
            });
            satellites.insert(node.clone(), TestSatellite::start(log, &node));
        }

        TestCluster {
            state,
            datastore,
            registry,
            updater,
            snapshots,
            inbound,
            satellites,
            _full_sync: full_sync,
        }
    }

    pub fn satellite(&mut self, node: &str) -> &mut TestSatellite {
        self.satellites.get_mut(&name(node)).expect("satellite exists")
    }

    /// Adds a resource definition with one diskful instance per node
    pub fn add_resource(&self, rsc: &str, nodes: &[&str]) {
        let mut rsc_dfn =
            ResourceDefinition::new(ResourceName::new(rsc).unwrap(), Uuid::new_v4());
        for node in nodes {
            rsc_dfn.add_resource(ResourceInstanceState {
                node: name(node),
                uuid: Uuid::new_v4(),
                diskless: false,
                volumes: vec![VolumeState {
                    number: 0,
                    stor_pool: StorPoolName::new(THIN_POOL).unwrap(),
                }],
                in_progress_snapshots: BTreeMap::new(),
            });
        }
        self.state.put_resource_definition(rsc_dfn);
    }

    /// Establishes a new connection to the satellite on `node`
    ///
    /// The controller sends a full sync right away.
    pub fn connect(&mut self, node: &str) {
        let (connection, inbox) = ChannelPeer::new(format!("controller-to-{node}"));
        let connection = Arc::new(connection);
        {
            let satellite = self.satellite(node);
            satellite.inbox = Some(inbox);
            satellite.connection = Some(Arc::clone(&connection));
            satellite
                .applier
                .controller_connected(satellite.to_controller.clone());
        }
        self.registry.connect(name(node), connection);
    }

    /// Drops the connection to the satellite on `node`
    pub fn disconnect(&mut self, node: &str) {
        if let Some(connection) = self.satellite(node).connection.take() {
            connection.set_connected(false);
        }
        self.satellite(node).inbox = None;
        self.registry.disconnect(&name(node));
    }

    /// Hands every message the satellite on `node` sent to the controller
    ///
    /// Returns the number of messages delivered.
    pub fn deliver_to_controller(&mut self, node: &str) -> usize {
        let node = name(node);
        let mut delivered = 0;
        loop {
            let satellite =
                self.satellites.get_mut(&node).expect("satellite exists");
            let Ok(bytes) = satellite.outbox.try_recv() else {
                return delivered;
            };
            self.inbound.handle_message(&node, &bytes).unwrap();
            delivered += 1;
        }
    }

    /// Shuts down every satellite's device manager
    pub fn shutdown(&self) {
        for satellite in self.satellites.values() {
            satellite.device_manager.shutdown();
        }
    }
}
