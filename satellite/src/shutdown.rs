// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative shutdown signalling
//!
//! Shutdown is a `watch` channel of `bool`.  Setting it to `true`, or dropping
//! the sender, wakes every suspension point observing it.

use tokio::sync::watch;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("shutdown requested")]
pub struct ShutdownRequested;

pub(crate) fn is_requested(rx: &mut watch::Receiver<bool>) -> bool {
    *rx.borrow_and_update() || rx.has_changed().is_err()
}

/// Completes once shutdown has been requested
///
/// Cancel-safe.
pub(crate) async fn requested(rx: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which is a shutdown as well.
    let _ = rx.wait_for(|requested| *requested).await;
}
