// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Incremental controller-to-satellite updates
//!
//! Every incremental message carries the next update id of the receiving
//! satellite's connection, so the satellite can apply them in order.

use crate::peer_registry::{PeerRegistry, SatellitePeer};
use crate::state::ClusterState;
use slog::{debug, error, o, warn, Logger};
use std::sync::Arc;
use stormesh_common::access::{AccessContext, AccessDeniedError, Privilege};
use stormesh_common::identity::{NodeName, ResourceName};
use stormesh_common::messages::{ControllerMsg, SatelliteMsg};
use stormesh_common::peer::PeerError;
use stormesh_common::serializer::{MessageSerializer, SerializeError};
use stormesh_common::sync::SyncHeader;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("satellite on node {0} is not connected")]
    NotConnected(NodeName),

    #[error("{0} is not an update request")]
    NotARequest(&'static str),

    #[error(transparent)]
    AccessDenied(#[from] AccessDeniedError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Send(#[from] PeerError),
}

pub struct SatelliteUpdater {
    log: Logger,
    ctx: AccessContext,
    state: Arc<ClusterState>,
    registry: Arc<PeerRegistry>,
    serializer: Arc<dyn MessageSerializer>,
}

impl SatelliteUpdater {
    pub fn new(
        log: &Logger,
        ctx: AccessContext,
        state: Arc<ClusterState>,
        registry: Arc<PeerRegistry>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> SatelliteUpdater {
        SatelliteUpdater {
            log: log.new(o!("component" => "SatelliteUpdater")),
            ctx,
            state,
            registry,
            serializer,
        }
    }

    /// Answers an update request from the satellite on `node` with the
    /// current state of the requested object
    ///
    /// Objects that no longer exist, or that the satellite should no longer
    /// know about, are answered with the matching apply-deleted message.
    pub fn answer_request(
        &self,
        node: &NodeName,
        request: &SatelliteMsg,
    ) -> Result<(), UpdaterError> {
        let peer = self
            .registry
            .peer(node)
            .ok_or_else(|| UpdaterError::NotConnected(node.clone()))?;
        self.ctx.require(Privilege::ObjView, "answer update request")?;
        if peer.is_full_sync_failed() {
            // The satellite drops incremental updates until its next full
            // sync, which carries the requested object anyway.
            debug!(
                self.log,
                "satellite failed its full sync; skipped answer";
                "node" => %node,
                "request" => request.kind(),
            );
            return Ok(());
        }

        let result = match request {
            SatelliteMsg::RequestNode { node: requested, uuid } => {
                match self.state.node(requested) {
                    Some(state) => {
                        self.note_uuid(requested, *uuid, state.uuid);
                        self.send(&peer, |header| ControllerMsg::ApplyNode {
                            header,
                            node: state,
                        })
                    }
                    None => {
                        self.send(&peer, |header| ControllerMsg::ApplyDeletedNode {
                            header,
                            node: requested.clone(),
                        })
                    }
                }
            }
            SatelliteMsg::RequestResourceDefinition { rsc, .. }
            | SatelliteMsg::RequestResource { rsc, .. } => {
                self.send_resource(&peer, rsc)
            }
            SatelliteMsg::RequestStorPool { stor_pool, uuid } => {
                match self.state.stor_pool(node, stor_pool) {
                    Some(state) => {
                        self.note_uuid(stor_pool, *uuid, state.uuid);
                        self.send(&peer, |header| ControllerMsg::ApplyStorPool {
                            header,
                            stor_pool: state,
                        })
                    }
                    None => self.send(&peer, |header| {
                        ControllerMsg::ApplyDeletedStorPool {
                            header,
                            stor_pool: stor_pool.clone(),
                        }
                    }),
                }
            }
            SatelliteMsg::RequestInProgressSnapshot { rsc, snapshot, .. } => {
                let in_progress = self
                    .state
                    .resource_state_for(node, rsc)
                    .and_then(|state| {
                        state.local.in_progress_snapshots.get(snapshot).cloned()
                    });
                match in_progress {
                    Some(snapshot) => self.send(&peer, |header| {
                        ControllerMsg::ApplyInProgressSnapshot {
                            header,
                            rsc: rsc.clone(),
                            snapshot,
                        }
                    }),
                    // The snapshot has ended; the resource state tells the
                    // satellite as much.
                    None => self.send_resource(&peer, rsc),
                }
            }
            SatelliteMsg::SnapshotPhaseReached { .. }
            | SatelliteMsg::FullSyncFailed { .. } => {
                return Err(UpdaterError::NotARequest(request.kind()));
            }
        };

        if let Err(err) = &result {
            error!(
                self.log,
                "failed to answer update request";
                "node" => %node,
                "request" => request.kind(),
                "error" => %err,
            );
        }
        result
    }

    /// Pushes the current state of `rsc` to every connected satellite that
    /// hosts an instance of it
    ///
    /// Satellites that are not connected receive the state with their next
    /// full sync.  Returns the number of satellites the update could not be
    /// sent to.
    pub fn update_satellites(&self, rsc: &ResourceName) -> usize {
        let Some(rsc_dfn) = self.state.resource_definition(rsc) else {
            return 0;
        };
        let mut failed = 0;
        for node in rsc_dfn.resources.keys() {
            let Some(peer) = self.registry.peer(node) else {
                debug!(
                    self.log,
                    "satellite not connected; skipped update";
                    "node" => %node,
                    "resource" => %rsc,
                );
                continue;
            };
            if !peer.is_connected() || peer.is_full_sync_failed() {
                debug!(
                    self.log,
                    "satellite cannot take updates; skipped update";
                    "node" => %node,
                    "resource" => %rsc,
                );
                continue;
            }
            if let Err(err) = self.send_resource(&peer, rsc) {
                warn!(
                    self.log,
                    "failed to update satellite";
                    "node" => %node,
                    "resource" => %rsc,
                    "error" => %err,
                );
                failed += 1;
            }
        }
        failed
    }

    fn send_resource(
        &self,
        peer: &SatellitePeer,
        rsc: &ResourceName,
    ) -> Result<(), UpdaterError> {
        match self.state.resource_state_for(peer.node(), rsc) {
            Some(resource) => self.send(peer, |header| {
                ControllerMsg::ApplyResource { header, resource }
            }),
            None => self.send(peer, |header| {
                ControllerMsg::ApplyDeletedResource { header, rsc: rsc.clone() }
            }),
        }
    }

    fn send<F>(&self, peer: &SatellitePeer, build: F) -> Result<(), UpdaterError>
    where
        F: FnOnce(SyncHeader) -> ControllerMsg,
    {
        let mut kind = "";
        let update_id = peer.send_update(&self.ctx, |update_id| {
            let msg = build(SyncHeader::incremental(update_id));
            kind = msg.kind();
            self.serializer
                .encode_controller_msg(&msg)
                .map_err(UpdaterError::from)
        })?;
        debug!(
            self.log,
            "sent update";
            "node" => %peer.node(),
            "message" => kind,
            "update_id" => %update_id,
        );
        Ok(())
    }

    fn note_uuid<N: std::fmt::Display>(
        &self,
        name: &N,
        requested: Uuid,
        current: Uuid,
    ) {
        // The satellite reports the divergence when it applies the answer.
        if requested != current {
            debug!(
                self.log,
                "satellite requested an object it knows by another uuid";
                "object" => %name,
                "requested" => %requested,
                "current" => %current,
            );
        }
    }
}
