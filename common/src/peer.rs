// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to an established connection with a remote peer
//!
//! Connection establishment, reconnection and keep-alive belong to the
//! transport layer.  The synchronization protocol only needs to ask whether a
//! peer is connected and to hand it an already serialized message.

use crate::access::{AccessContext, AccessDeniedError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer {peer_id} is not connected")]
    NotConnected { peer_id: String },

    #[error(transparent)]
    AccessDenied(#[from] AccessDeniedError),

    #[error("failed to send message to peer {peer_id}: {message}")]
    Io { peer_id: String, message: String },
}

pub trait PeerConnection: Send + Sync {
    /// Identifies the connection in log messages
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Queues `payload` for delivery
    ///
    /// `ctx` is the context of the sender; the connection may refuse to send
    /// on behalf of a context that lacks the privilege to use it.
    fn send_message(
        &self,
        ctx: &AccessContext,
        payload: Vec<u8>,
    ) -> Result<(), PeerError>;
}
