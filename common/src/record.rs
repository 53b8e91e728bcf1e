// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity records and divergence detection

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Kind of object an [`EntityRecord`] identifies
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum EntityKind {
    Node,
    ResourceDefinition,
    Resource,
    StorPool,
    SnapshotDefinition,
    Snapshot,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Node => "node",
            EntityKind::ResourceDefinition => "resource definition",
            EntityKind::Resource => "resource",
            EntityKind::StorPool => "storage pool",
            EntityKind::SnapshotDefinition => "snapshot definition",
            EntityKind::Snapshot => "snapshot",
        };
        f.write_str(s)
    }
}

/// The same name is known locally and remotely with different UUIDs
///
/// This is never a normal update.  The local copy cannot be repaired in
/// place; the connection that delivered the remote record has to be treated
/// as desynchronized and fully re-synced.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error(
    "divergent UUIDs for {kind} {name:?}: local {local}, remote {remote}"
)]
pub struct DivergenceError {
    pub kind: EntityKind,
    pub name: String,
    pub local: Uuid,
    pub remote: Uuid,
}

/// An identity together with the UUID assigned when the entity was created
///
/// The UUID never changes for the lifetime of the entity.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct EntityRecord<N> {
    pub name: N,
    pub uuid: Uuid,
}

impl<N> EntityRecord<N> {
    pub fn new(name: N, uuid: Uuid) -> EntityRecord<N> {
        EntityRecord { name, uuid }
    }
}

impl<N: PartialEq + fmt::Display> EntityRecord<N> {
    /// Verifies that `incoming` does not contradict this local record
    ///
    /// Records with different names describe different entities and never
    /// diverge.
    pub fn check_divergence(
        &self,
        kind: EntityKind,
        incoming: &EntityRecord<N>,
    ) -> Result<(), DivergenceError> {
        if self.name != incoming.name {
            return Ok(());
        }
        check_uuid(kind, &self.name, self.uuid, incoming.uuid)
    }
}

/// Verifies that the locally known `local` UUID for `name` equals `remote`
pub fn check_uuid<N: fmt::Display + ?Sized>(
    kind: EntityKind,
    name: &N,
    local: Uuid,
    remote: Uuid,
) -> Result<(), DivergenceError> {
    if local == remote {
        Ok(())
    } else {
        Err(DivergenceError { kind, name: name.to_string(), local, remote })
    }
}
