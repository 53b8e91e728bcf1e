// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Access to the current connection to the controller

use std::sync::{Arc, RwLock};
use stormesh_common::identity::NodeName;
use stormesh_common::peer::PeerConnection;

/// Holds the connection to the controller, if one is established
///
/// The transport layer installs a new peer after every (re)connection and
/// clears it on disconnect.
pub struct ControllerPeerConnector {
    local_node: NodeName,
    peer: RwLock<Option<Arc<dyn PeerConnection>>>,
}

impl ControllerPeerConnector {
    pub fn new(local_node: NodeName) -> ControllerPeerConnector {
        ControllerPeerConnector { local_node, peer: RwLock::new(None) }
    }

    pub fn local_node(&self) -> &NodeName {
        &self.local_node
    }

    pub fn set_controller_peer(&self, peer: Arc<dyn PeerConnection>) {
        *self.peer.write().unwrap() = Some(peer);
    }

    pub fn clear_controller_peer(&self) {
        *self.peer.write().unwrap() = None;
    }

    pub fn controller_peer(&self) -> Option<Arc<dyn PeerConnection>> {
        self.peer.read().unwrap().clone()
    }
}
