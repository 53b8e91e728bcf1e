// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sends a satellite everything it needs to know in one message
//!
//! A full sync carries the satellite's node, every node that shares a
//! resource with it, every storage pool on the node and the satellite's view
//! of every resource it hosts.  Each full sync is tagged with an id that the
//! satellite must be expecting; incremental updates sent after it are
//! numbered from [`UpdateId::initial`] again.
//!
//! [`UpdateId::initial`]: stormesh_common::sync::UpdateId::initial

use crate::peer_registry::{ConnectionObserver, SatellitePeer};
use crate::state::ClusterState;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use stormesh_common::access::{AccessContext, AccessDeniedError, Privilege};
use stormesh_common::identity::NodeName;
use stormesh_common::messages::{ControllerMsg, FullSyncPayload};
use stormesh_common::peer::PeerError;
use stormesh_common::serializer::{MessageSerializer, SerializeError};
use stormesh_common::sync::{FullSyncId, SyncHeader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FullSyncError {
    #[error("not allowed to gather full sync data")]
    AccessDenied(#[from] AccessDeniedError),

    #[error("node {0} does not exist")]
    UnknownNode(NodeName),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("failed to send full sync")]
    Send(#[from] PeerError),
}

pub struct FullSyncCoordinator {
    log: Logger,
    ctx: AccessContext,
    state: Arc<ClusterState>,
    serializer: Arc<dyn MessageSerializer>,
}

impl FullSyncCoordinator {
    pub fn new(
        log: &Logger,
        ctx: AccessContext,
        state: Arc<ClusterState>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> FullSyncCoordinator {
        FullSyncCoordinator {
            log: log.new(o!("component" => "FullSyncCoordinator")),
            ctx,
            state,
            serializer,
        }
    }

    /// Gathers the objects the satellite on `node` must know about
    pub fn build_payload(
        &self,
        node: &NodeName,
    ) -> Result<FullSyncPayload, FullSyncError> {
        self.ctx.require(Privilege::ObjView, "gather full sync data")?;
        let local = self
            .state
            .node(node)
            .ok_or_else(|| FullSyncError::UnknownNode(node.clone()))?;

        let rsc_dfns = self.state.resource_definitions_on(node);
        let mut node_names = BTreeSet::new();
        for rsc_dfn in &rsc_dfns {
            node_names.extend(
                rsc_dfn.resources.keys().filter(|peer| *peer != node).cloned(),
            );
        }

        let mut nodes = vec![local];
        for name in node_names {
            match self.state.node(&name) {
                Some(peer) => nodes.push(peer),
                None => warn!(
                    self.log,
                    "resource refers to a node that does not exist";
                    "node" => %name,
                ),
            }
        }

        let resources = rsc_dfns
            .iter()
            .filter_map(|rsc_dfn| rsc_dfn.state_for(node))
            .collect();

        Ok(FullSyncPayload {
            nodes,
            stor_pools: self.state.stor_pools_on(node),
            resources,
        })
    }

    /// Sends the full sync tagged `expected_full_sync_id` to `peer`
    pub fn send_full_sync(
        &self,
        peer: &SatellitePeer,
        expected_full_sync_id: FullSyncId,
    ) -> Result<(), FullSyncError> {
        let result = self.try_send_full_sync(peer, expected_full_sync_id);
        match &result {
            Ok(()) => info!(
                self.log,
                "sent full sync";
                "node" => %peer.node(),
                "full_sync_id" => %expected_full_sync_id,
            ),
            Err(err) => error!(
                self.log,
                "implementation error while sending full sync";
                "node" => %peer.node(),
                "full_sync_id" => %expected_full_sync_id,
                "error" => %err,
            ),
        }
        result
    }

    fn try_send_full_sync(
        &self,
        peer: &SatellitePeer,
        expected_full_sync_id: FullSyncId,
    ) -> Result<(), FullSyncError> {
        // The id must be in place before the payload is built.  Otherwise an
        // older full sync still in flight could be taken for this one.
        peer.set_full_sync_id(expected_full_sync_id);

        let payload = self.build_payload(peer.node())?;
        debug!(
            self.log,
            "built full sync";
            "node" => %peer.node(),
            "nodes" => payload.nodes.len(),
            "stor_pools" => payload.stor_pools.len(),
            "resources" => payload.resources.len(),
        );
        let msg = ControllerMsg::FullSync {
            header: SyncHeader::full_sync(expected_full_sync_id),
            payload,
        };
        let bytes = self.serializer.encode_controller_msg(&msg)?;
        peer.send(&self.ctx, bytes)?;
        Ok(())
    }
}

impl ConnectionObserver for FullSyncCoordinator {
    fn on_connected(&self, peer: &Arc<SatellitePeer>) {
        if let Err(err) = self.send_full_sync(peer, peer.full_sync_id().next())
        {
            warn!(
                self.log,
                "satellite stays unsynchronized until it reconnects";
                "node" => %peer.node(),
                "error" => %err,
            );
        }
    }

    fn on_disconnected(&self, _node: &NodeName) {}
}
