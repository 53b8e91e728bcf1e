// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The controller side of cluster synchronization
//!
//! The controller owns the authoritative [`state::ClusterState`].  When a
//! satellite connects, the [`full_sync::FullSyncCoordinator`] sends it a full
//! sync; afterwards the [`satellite_updater::SatelliteUpdater`] pushes
//! incremental updates and answers the satellite's update requests.
//! Snapshots are driven through their phases by the
//! [`snapshot::SnapshotCoordinator`].

pub mod config;
pub mod datastore;
pub mod full_sync;
pub mod inbound;
pub mod peer_registry;
pub mod satellite_updater;
pub mod snapshot;
pub mod state;
