// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Requests for the current state of objects, sent to the controller

use crate::controller_peer::ControllerPeerConnector;
use crate::update_tracker::UpdateBundle;
use slog::{debug, error, warn, Logger};
use std::sync::Arc;
use stormesh_common::access::{AccessContext, AccessDeniedError};
use stormesh_common::identity::{
    NodeName, ResourceName, SnapshotName, StorPoolName,
};
use stormesh_common::messages::{SatelliteMsg, SnapshotPhase};
use stormesh_common::peer::PeerError;
use stormesh_common::serializer::{MessageSerializer, SerializeError};
use stormesh_common::sync::FullSyncId;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ImplementationCause {
    #[error(transparent)]
    Serialize(#[from] SerializeError),
    #[error(transparent)]
    AccessDenied(#[from] AccessDeniedError),
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateRequestError {
    #[error("no connection to the controller")]
    NoControllerPeer,

    /// A defect in this process; retrying will not help
    #[error("implementation error sending {kind} message: {err}")]
    ImplementationError {
        kind: &'static str,
        #[source]
        err: ImplementationCause,
    },

    #[error("failed to send {kind} message to the controller: {err}")]
    PeerSend {
        kind: &'static str,
        #[source]
        err: PeerError,
    },
}

impl UpdateRequestError {
    pub fn is_implementation_error(&self) -> bool {
        matches!(self, UpdateRequestError::ImplementationError { .. })
    }
}

/// Turns update notifications into request messages to the controller
///
/// Holds no state of its own.  Failures are logged; none of them are retried
/// here.  A request that never gets answered stays pending until a full sync
/// supersedes it.
#[derive(Clone)]
pub struct UpdateRequester {
    log: Logger,
    ctx: AccessContext,
    connector: Arc<ControllerPeerConnector>,
    serializer: Arc<dyn MessageSerializer>,
}

impl UpdateRequester {
    pub fn new(
        log: &Logger,
        ctx: AccessContext,
        connector: Arc<ControllerPeerConnector>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> UpdateRequester {
        UpdateRequester {
            log: log.new(slog::o!("component" => "UpdateRequester")),
            ctx,
            connector,
            serializer,
        }
    }

    pub fn connector(&self) -> &Arc<ControllerPeerConnector> {
        &self.connector
    }

    pub fn request_node_update(
        &self,
        node: &NodeName,
        uuid: Uuid,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::RequestNode { node: node.clone(), uuid })
    }

    pub fn request_resource_definition_update(
        &self,
        rsc: &ResourceName,
        uuid: Uuid,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::RequestResourceDefinition {
            rsc: rsc.clone(),
            uuid,
        })
    }

    pub fn request_resource_update(
        &self,
        node: &NodeName,
        rsc: &ResourceName,
        uuid: Uuid,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::RequestResource {
            node: node.clone(),
            rsc: rsc.clone(),
            uuid,
        })
    }

    pub fn request_stor_pool_update(
        &self,
        stor_pool: &StorPoolName,
        uuid: Uuid,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::RequestStorPool {
            stor_pool: stor_pool.clone(),
            uuid,
        })
    }

    pub fn request_in_progress_snapshot_update(
        &self,
        rsc: &ResourceName,
        snapshot_uuid: Uuid,
        snapshot: &SnapshotName,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::RequestInProgressSnapshot {
            rsc: rsc.clone(),
            snapshot: snapshot.clone(),
            snapshot_uuid,
        })
    }

    /// Tells the controller this node has completed a snapshot phase
    pub fn notify_snapshot_phase_reached(
        &self,
        rsc: &ResourceName,
        snapshot: &SnapshotName,
        phase: SnapshotPhase,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::SnapshotPhaseReached {
            rsc: rsc.clone(),
            snapshot: snapshot.clone(),
            phase,
        })
    }

    /// Tells the controller the full sync with the given id was not applied
    pub fn notify_full_sync_failed(
        &self,
        full_sync_id: FullSyncId,
    ) -> Result<(), UpdateRequestError> {
        self.send(SatelliteMsg::FullSyncFailed { full_sync_id })
    }

    /// Requests every object in `bundle` that needs a controller round trip
    ///
    /// A failure for one object does not prevent requests for the others.
    /// Returns the number of requests that could not be sent.
    pub fn request_updates(&self, bundle: &UpdateBundle) -> usize {
        let mut failed = 0;
        let mut tally = |result: Result<(), UpdateRequestError>| {
            if result.is_err() {
                failed += 1;
            }
        };
        for (node, uuid) in &bundle.nodes {
            tally(self.request_node_update(node, *uuid));
        }
        for (rsc, uuid) in &bundle.resource_definitions {
            tally(self.request_resource_definition_update(rsc, *uuid));
        }
        for (rsc, nodes) in &bundle.resources {
            for (node, uuid) in nodes {
                tally(self.request_resource_update(node, rsc, *uuid));
            }
        }
        for (stor_pool, uuid) in &bundle.stor_pools {
            tally(self.request_stor_pool_update(stor_pool, *uuid));
        }
        failed
    }

    fn send(&self, msg: SatelliteMsg) -> Result<(), UpdateRequestError> {
        let kind = msg.kind();
        let result = self.try_send(&msg);
        match &result {
            Ok(()) => {
                debug!(self.log, "sent request"; "message" => kind);
            }
            Err(err) if err.is_implementation_error() => {
                error!(
                    self.log,
                    "implementation error while requesting an update";
                    "message" => ?msg,
                    "error" => %err,
                );
            }
            Err(err) => {
                warn!(
                    self.log,
                    "could not request an update";
                    "message" => kind,
                    "error" => %err,
                );
            }
        }
        result
    }

    fn try_send(&self, msg: &SatelliteMsg) -> Result<(), UpdateRequestError> {
        let kind = msg.kind();
        let payload = self.serializer.encode_satellite_msg(msg).map_err(
            |err| UpdateRequestError::ImplementationError {
                kind,
                err: err.into(),
            },
        )?;
        if payload.is_empty() {
            return Err(UpdateRequestError::ImplementationError {
                kind,
                err: SerializeError::EmptyPayload { kind }.into(),
            });
        }

        let peer = self
            .connector
            .controller_peer()
            .ok_or(UpdateRequestError::NoControllerPeer)?;
        peer.send_message(&self.ctx, payload).map_err(|err| match err {
            PeerError::AccessDenied(err) => {
                UpdateRequestError::ImplementationError {
                    kind,
                    err: err.into(),
                }
            }
            err => UpdateRequestError::PeerSend { kind, err },
        })
    }
}
