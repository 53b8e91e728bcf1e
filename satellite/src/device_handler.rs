// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The convergence work run for one resource per reconciliation cycle

use crate::phase_barrier::PhaseArrival;
use slog::{debug, warn, Logger};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stormesh_common::messages::ResourceState;

/// Converges the local block devices of one resource to its desired state
///
/// Implemented by the storage layer.  The device manager calls it at most
/// once per resource per cycle and never for the same resource concurrently.
pub trait DeviceHandler: Send + Sync + 'static {
    fn dispatch_resource(
        &self,
        resource: ResourceState,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Tears down the local devices of a resource the controller deleted
    ///
    /// `resource` is the last state the satellite knew.
    fn delete_resource(
        &self,
        resource: ResourceState,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// What a device handler run does with its resource
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DispatchKind {
    Converge,
    Delete,
}

/// One scheduled run of a [`DeviceHandler`] for one resource
///
/// The invocation is registered on the device manager's phase barrier when it
/// is created and arrives when it is dropped, whether the handler succeeded,
/// failed, was skipped or panicked.
pub(crate) struct DeviceHandlerInvocation<H> {
    log: Logger,
    handler: Arc<H>,
    resource: ResourceState,
    kind: DispatchKind,
    abort: Arc<AtomicBool>,
    arrival: PhaseArrival,
}

impl<H: DeviceHandler> DeviceHandlerInvocation<H> {
    pub(crate) fn new(
        log: &Logger,
        handler: Arc<H>,
        resource: ResourceState,
        kind: DispatchKind,
        abort: Arc<AtomicBool>,
        arrival: PhaseArrival,
    ) -> Self {
        let log = log.new(slog::o!(
            "resource" => resource.name().to_string(),
            "phase" => arrival.phase(),
            "delete" => kind == DispatchKind::Delete,
        ));
        DeviceHandlerInvocation { log, handler, resource, kind, abort, arrival }
    }

    pub(crate) async fn run(self) {
        let DeviceHandlerInvocation {
            log,
            handler,
            resource,
            kind,
            abort,
            arrival,
        } = self;

        if abort.load(Ordering::SeqCst) {
            debug!(log, "device handler aborted before it started");
        } else {
            debug!(log, "running device handler");
            let result = match kind {
                DispatchKind::Converge => handler.dispatch_resource(resource).await,
                DispatchKind::Delete => handler.delete_resource(resource).await,
            };
            match result {
                Ok(()) => debug!(log, "device handler finished"),
                Err(err) => {
                    warn!(
                        log,
                        "device handler failed";
                        "error" => format!("{err:#}"),
                    );
                }
            }
        }

        arrival.arrive();
    }
}
