// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sequence numbers used to order controller-to-satellite updates
//!
//! Every satellite connection carries two counters:
//!
//! * a [`FullSyncId`], set by the controller immediately before it builds a
//!   full-sync payload.  The satellite only applies the full sync whose id it
//!   is expecting and ignores stale ones.
//! * an [`UpdateId`], incremented for every incremental message sent after a
//!   full sync.  The satellite applies incremental messages strictly in this
//!   order.
//!
//! Messages that do not participate in one of the sequences carry the
//! respective sentinel value.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct FullSyncId(u64);

impl FullSyncId {
    /// Carried by incremental messages, which are not part of a full sync
    pub const NOT_APPLICABLE: FullSyncId = FullSyncId(0);

    /// The id of the first full sync on a new connection
    pub const fn initial() -> FullSyncId {
        FullSyncId(1)
    }

    pub const fn from_raw(value: u64) -> FullSyncId {
        FullSyncId(value)
    }

    pub fn next(&self) -> FullSyncId {
        let next = self.0 + 1;
        assert!(next < u64::MAX, "full sync id overflow");
        FullSyncId(next)
    }

    pub fn is_applicable(&self) -> bool {
        *self != Self::NOT_APPLICABLE
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FullSyncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(transparent)]
pub struct UpdateId(u64);

impl UpdateId {
    /// Carried by full-sync payloads, which replace the incremental sequence
    pub const NOT_INCREMENTAL: UpdateId = UpdateId(0);

    /// The id of the first incremental update after a full sync
    pub const fn initial() -> UpdateId {
        UpdateId(1)
    }

    pub const fn from_raw(value: u64) -> UpdateId {
        UpdateId(value)
    }

    pub fn next(&self) -> UpdateId {
        let next = self.0 + 1;
        assert!(next < u64::MAX, "update id overflow");
        UpdateId(next)
    }

    pub fn is_incremental(&self) -> bool {
        *self != Self::NOT_INCREMENTAL
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequencing header carried by every controller-to-satellite message
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SyncHeader {
    pub full_sync_id: FullSyncId,
    pub update_id: UpdateId,
}

impl SyncHeader {
    /// Header for a full-sync payload
    pub fn full_sync(full_sync_id: FullSyncId) -> SyncHeader {
        SyncHeader { full_sync_id, update_id: UpdateId::NOT_INCREMENTAL }
    }

    /// Header for an incremental update
    pub fn incremental(update_id: UpdateId) -> SyncHeader {
        SyncHeader { full_sync_id: FullSyncId::NOT_APPLICABLE, update_id }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sentinels() {
        assert!(!FullSyncId::NOT_APPLICABLE.is_applicable());
        assert!(FullSyncId::initial().is_applicable());
        assert!(!UpdateId::NOT_INCREMENTAL.is_incremental());
        assert!(UpdateId::initial().is_incremental());
        assert!(FullSyncId::initial() > FullSyncId::NOT_APPLICABLE);

        let header = SyncHeader::full_sync(FullSyncId::from_raw(5));
        assert_eq!(header.update_id, UpdateId::NOT_INCREMENTAL);
        let header = SyncHeader::incremental(UpdateId::from_raw(3));
        assert!(!header.full_sync_id.is_applicable());
    }

    #[test]
    fn test_ids_advance() {
        let id = FullSyncId::from_raw(5);
        assert_eq!(id.next(), FullSyncId::from_raw(6));
        assert_eq!(UpdateId::initial().next().as_u64(), 2);
    }
}
