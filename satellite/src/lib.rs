// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The stormesh satellite
//!
//! A satellite keeps a local copy of the cluster objects the controller
//! shares with its node and converges local block devices to them.  Update
//! notifications accumulate in the [`update_tracker::UpdateTracker`]; the
//! [`device_manager`] loop turns them into update requests, waits for the
//! controller's answers to be applied by [`apply::UpdateApplier`] and then
//! runs a [`device_handler::DeviceHandler`] for every affected resource.

pub mod apply;
pub mod config;
pub mod controller_peer;
pub mod device_handler;
pub mod device_manager;
pub mod phase_barrier;
pub mod shutdown;
pub mod state;
pub mod update_requester;
pub mod update_tracker;
mod worker_pool;

pub use worker_pool::DEFAULT_MAX_PARALLEL_HANDLERS;
