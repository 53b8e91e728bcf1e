// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory [`PeerConnection`] implementations

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use stormesh_common::access::{AccessContext, Privilege};
use stormesh_common::messages::{ControllerMsg, SatelliteMsg};
use stormesh_common::peer::{PeerConnection, PeerError};
use stormesh_common::serializer::{JsonSerializer, MessageSerializer};
use tokio::sync::mpsc;

/// A peer that keeps every payload it was asked to send
pub struct RecordingPeer {
    id: String,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl RecordingPeer {
    pub fn new(id: impl Into<String>) -> RecordingPeer {
        RecordingPeer {
            id: id.into(),
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn disconnected(id: impl Into<String>) -> RecordingPeer {
        let peer = RecordingPeer::new(id);
        peer.set_connected(false);
        peer
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every subsequent send fail with an I/O error
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Decodes everything sent so far as satellite-to-controller messages
    pub fn sent_satellite_msgs(&self) -> Vec<SatelliteMsg> {
        self.sent_payloads()
            .iter()
            .map(|bytes| {
                JsonSerializer
                    .decode_satellite_msg(bytes)
                    .expect("recorded payload is a satellite message")
            })
            .collect()
    }

    /// Decodes everything sent so far as controller-to-satellite messages
    pub fn sent_controller_msgs(&self) -> Vec<ControllerMsg> {
        self.sent_payloads()
            .iter()
            .map(|bytes| {
                JsonSerializer
                    .decode_controller_msg(bytes)
                    .expect("recorded payload is a controller message")
            })
            .collect()
    }
}

impl PeerConnection for RecordingPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send_message(
        &self,
        ctx: &AccessContext,
        payload: Vec<u8>,
    ) -> Result<(), PeerError> {
        ctx.require(Privilege::ObjUse, "send message")?;
        if !self.is_connected() {
            return Err(PeerError::NotConnected { peer_id: self.id.clone() });
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(PeerError::Io {
                peer_id: self.id.clone(),
                message: String::from("injected send failure"),
            });
        }
        self.sent.lock().unwrap().push(payload);
        Ok(())
    }
}

/// A peer that forwards every payload into a channel
///
/// Tests wire a controller to a satellite (or the reverse) by draining the
/// receiving end and handing the payloads to the other side.
pub struct ChannelPeer {
    id: String,
    connected: AtomicBool,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelPeer {
    pub fn new(
        id: impl Into<String>,
    ) -> (ChannelPeer, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer =
            ChannelPeer { id: id.into(), connected: AtomicBool::new(true), tx };
        (peer, rx)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl PeerConnection for ChannelPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn send_message(
        &self,
        ctx: &AccessContext,
        payload: Vec<u8>,
    ) -> Result<(), PeerError> {
        ctx.require(Privilege::ObjUse, "send message")?;
        if !self.is_connected() {
            return Err(PeerError::NotConnected { peer_id: self.id.clone() });
        }
        self.tx.send(payload).map_err(|_| PeerError::Io {
            peer_id: self.id.clone(),
            message: String::from("receiving end closed"),
        })
    }
}
