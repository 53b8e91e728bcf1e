// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared by the stormesh controller and its satellites
//!
//! Nothing in here performs I/O. The controller and satellite crates consume
//! these types and the collaborator interfaces ([`peer::PeerConnection`],
//! [`serializer::MessageSerializer`], [`access::AccessContext`]) to implement
//! the update synchronization protocol.

pub mod access;
pub mod api;
pub mod identity;
pub mod messages;
pub mod peer;
pub mod record;
pub mod serializer;
pub mod sync;
