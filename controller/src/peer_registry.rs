// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tracks the satellite connected for each node
//!
//! The transport layer reports established and lost connections through
//! [`PeerRegistry::connect`] and [`PeerRegistry::disconnect`]; interested
//! components register a [`ConnectionObserver`] to hear about them.

use slog::{debug, info, o, Logger};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use stormesh_common::access::AccessContext;
use stormesh_common::identity::NodeName;
use stormesh_common::peer::{PeerConnection, PeerError};
use stormesh_common::sync::{FullSyncId, UpdateId};

#[derive(Debug)]
struct SyncCounters {
    full_sync_id: FullSyncId,
    next_update_id: UpdateId,
    full_sync_failed: bool,
}

/// The connection to one node's satellite, with its sequencing counters
pub struct SatellitePeer {
    node: NodeName,
    connection: Arc<dyn PeerConnection>,
    counters: Mutex<SyncCounters>,
}

impl SatellitePeer {
    fn new(
        node: NodeName,
        connection: Arc<dyn PeerConnection>,
        last_full_sync_id: FullSyncId,
    ) -> SatellitePeer {
        SatellitePeer {
            node,
            connection,
            counters: Mutex::new(SyncCounters {
                full_sync_id: last_full_sync_id,
                next_update_id: UpdateId::initial(),
                full_sync_failed: false,
            }),
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.node
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The id of the most recent full sync sent to this satellite
    ///
    /// [`FullSyncId::NOT_APPLICABLE`] if none was sent yet.
    pub fn full_sync_id(&self) -> FullSyncId {
        self.counters.lock().unwrap().full_sync_id
    }

    /// Records the id of the full sync about to be sent and restarts the
    /// incremental update sequence
    pub fn set_full_sync_id(&self, full_sync_id: FullSyncId) {
        let mut counters = self.counters.lock().unwrap();
        counters.full_sync_id = full_sync_id;
        counters.next_update_id = UpdateId::initial();
        counters.full_sync_failed = false;
    }

    /// The id the next incremental update to this satellite will carry
    pub fn next_update_id(&self) -> UpdateId {
        self.counters.lock().unwrap().next_update_id
    }

    /// Sends the incremental update that `encode` builds for the next update
    /// id, and returns that id
    ///
    /// The id is only used up once the message was handed to the connection.
    /// The satellite applies updates strictly in order, so a gap left by a
    /// failed send would hold back every later update.
    pub fn send_update<F, E>(
        &self,
        ctx: &AccessContext,
        encode: F,
    ) -> Result<UpdateId, E>
    where
        F: FnOnce(UpdateId) -> Result<Vec<u8>, E>,
        E: From<PeerError>,
    {
        // Held across the send so that concurrent updates leave the
        // connection in id order.
        let mut counters = self.counters.lock().unwrap();
        let id = counters.next_update_id;
        let payload = encode(id)?;
        self.connection.send_message(ctx, payload)?;
        counters.next_update_id = id.next();
        Ok(id)
    }

    pub fn set_full_sync_failed(&self) {
        self.counters.lock().unwrap().full_sync_failed = true;
    }

    /// The satellite rejected the current full sync; it ignores incremental
    /// updates until it receives a new one
    pub fn is_full_sync_failed(&self) -> bool {
        self.counters.lock().unwrap().full_sync_failed
    }

    pub fn send(
        &self,
        ctx: &AccessContext,
        payload: Vec<u8>,
    ) -> Result<(), PeerError> {
        self.connection.send_message(ctx, payload)
    }
}

/// Callbacks for satellite connection changes
///
/// Called without any registry lock held, in registration order.
pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self, peer: &Arc<SatellitePeer>);
    fn on_disconnected(&self, node: &NodeName);
}

#[derive(Default)]
struct Peers {
    connected: BTreeMap<NodeName, Arc<SatellitePeer>>,
    /// Last full sync id of nodes that are no longer connected, so that ids
    /// keep increasing across reconnects
    last_full_sync_ids: BTreeMap<NodeName, FullSyncId>,
}

pub struct PeerRegistry {
    log: Logger,
    peers: RwLock<Peers>,
    observers: RwLock<Vec<Weak<dyn ConnectionObserver>>>,
}

impl PeerRegistry {
    pub fn new(log: &Logger) -> PeerRegistry {
        PeerRegistry {
            log: log.new(o!("component" => "PeerRegistry")),
            peers: RwLock::new(Peers::default()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers `observer` for connection changes
    ///
    /// The registry does not keep the observer alive.
    pub fn register_observer<O: ConnectionObserver + 'static>(
        &self,
        observer: &Arc<O>,
    ) {
        let observer: Arc<dyn ConnectionObserver> = observer.clone();
        self.observers.write().unwrap().push(Arc::downgrade(&observer));
    }

    fn observers(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        let mut observers = self.observers.write().unwrap();
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Records an established connection to the satellite on `node`
    ///
    /// A connection that is already registered for `node` is replaced and
    /// reported as disconnected first.
    pub fn connect(
        &self,
        node: NodeName,
        connection: Arc<dyn PeerConnection>,
    ) -> Arc<SatellitePeer> {
        let (peer, replaced) = {
            let mut peers = self.peers.write().unwrap();
            let replaced = peers.connected.remove(&node);
            let last_full_sync_id = match &replaced {
                Some(previous) => previous.full_sync_id(),
                None => peers
                    .last_full_sync_ids
                    .remove(&node)
                    .unwrap_or(FullSyncId::NOT_APPLICABLE),
            };
            let peer = Arc::new(SatellitePeer::new(
                node.clone(),
                connection,
                last_full_sync_id,
            ));
            peers.connected.insert(node.clone(), Arc::clone(&peer));
            (peer, replaced.is_some())
        };

        info!(
            self.log,
            "satellite connected";
            "node" => %node,
            "connection" => peer.connection.id(),
            "replaced" => replaced,
        );
        let observers = self.observers();
        if replaced {
            for observer in &observers {
                observer.on_disconnected(&node);
            }
        }
        for observer in &observers {
            observer.on_connected(&peer);
        }
        peer
    }

    /// Records the loss of the connection to the satellite on `node`
    ///
    /// Returns `false` if no connection was registered.
    pub fn disconnect(&self, node: &NodeName) -> bool {
        {
            let mut peers = self.peers.write().unwrap();
            let Some(peer) = peers.connected.remove(node) else {
                debug!(self.log, "disconnect of unknown satellite"; "node" => %node);
                return false;
            };
            peers.last_full_sync_ids.insert(node.clone(), peer.full_sync_id());
        }

        info!(self.log, "satellite disconnected"; "node" => %node);
        for observer in self.observers() {
            observer.on_disconnected(node);
        }
        true
    }

    pub fn peer(&self, node: &NodeName) -> Option<Arc<SatellitePeer>> {
        self.peers.read().unwrap().connected.get(node).cloned()
    }

    /// A satellite is registered for `node` and its connection is up
    pub fn is_connected(&self, node: &NodeName) -> bool {
        self.peer(node).is_some_and(|peer| peer.is_connected())
    }

    pub fn connected_nodes(&self) -> Vec<NodeName> {
        self.peers.read().unwrap().connected.keys().cloned().collect()
    }
}
