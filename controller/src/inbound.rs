// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Dispatch of messages received from satellites

use crate::peer_registry::PeerRegistry;
use crate::satellite_updater::{SatelliteUpdater, UpdaterError};
use crate::snapshot::{SnapshotCoordinator, SnapshotError};
use slog::{debug, error, o, Logger};
use std::sync::Arc;
use stormesh_common::identity::NodeName;
use stormesh_common::messages::SatelliteMsg;
use stormesh_common::serializer::{MessageSerializer, SerializeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InboundError {
    #[error(transparent)]
    Decode(#[from] SerializeError),

    #[error(transparent)]
    Update(#[from] UpdaterError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub struct InboundHandler {
    log: Logger,
    registry: Arc<PeerRegistry>,
    updater: Arc<SatelliteUpdater>,
    snapshots: Arc<SnapshotCoordinator>,
    serializer: Arc<dyn MessageSerializer>,
}

impl InboundHandler {
    pub fn new(
        log: &Logger,
        registry: Arc<PeerRegistry>,
        updater: Arc<SatelliteUpdater>,
        snapshots: Arc<SnapshotCoordinator>,
        serializer: Arc<dyn MessageSerializer>,
    ) -> InboundHandler {
        InboundHandler {
            log: log.new(o!("component" => "InboundHandler")),
            registry,
            updater,
            snapshots,
            serializer,
        }
    }

    /// Decodes and handles one message from the satellite on `node`
    pub fn handle_message(
        &self,
        node: &NodeName,
        bytes: &[u8],
    ) -> Result<(), InboundError> {
        let msg = self.serializer.decode_satellite_msg(bytes)?;
        self.handle(node, msg)
    }

    pub fn handle(
        &self,
        node: &NodeName,
        msg: SatelliteMsg,
    ) -> Result<(), InboundError> {
        debug!(
            self.log,
            "received satellite message";
            "node" => %node,
            "kind" => msg.kind(),
        );
        match msg {
            SatelliteMsg::SnapshotPhaseReached { rsc, snapshot, phase } => {
                self.snapshots.snapshot_phase_reached(
                    node, &rsc, &snapshot, phase,
                )?;
            }
            SatelliteMsg::FullSyncFailed { full_sync_id } => {
                let Some(peer) = self.registry.peer(node) else {
                    return Ok(());
                };
                if peer.full_sync_id() == full_sync_id {
                    error!(
                        self.log,
                        "satellite failed to apply full sync; \
                         incremental updates suspended";
                        "node" => %node,
                        "full_sync_id" => %full_sync_id,
                    );
                    peer.set_full_sync_failed();
                } else {
                    debug!(
                        self.log,
                        "ignored failure report for an older full sync";
                        "node" => %node,
                        "full_sync_id" => %full_sync_id,
                        "current" => %peer.full_sync_id(),
                    );
                }
            }
            request => self.updater.answer_request(node, &request)?,
        }
        Ok(())
    }
}
