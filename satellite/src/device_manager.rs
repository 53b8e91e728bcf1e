// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The satellite's reconciliation loop
//!
//! One task drives every cycle through these steps:
//!
//! 1. wait for update notifications in the [`UpdateTracker`]
//! 2. request the current state of every notified object from the controller
//! 3. wait until the apply handlers confirmed every requested object
//! 4. fold resource checks into the set of resources to dispatch
//! 5. wait until device state tracking is available
//! 6. run a [`DeviceHandler`] for every affected resource that exists locally
//!    or was deleted by the controller
//! 7. wait on the phase barrier until every handler of this cycle finished,
//!    then forget the deleted resources that were torn down
//!
//! A full sync replaces steps 1-3: every locally known resource is dispatched.
//! Every wait also observes the shutdown signal.

use crate::config::DeviceManagerConfig;
use crate::device_handler::{
    DeviceHandler, DeviceHandlerInvocation, DispatchKind,
};
use crate::phase_barrier::PhaseBarrier;
use crate::shutdown::{self, ShutdownRequested};
use crate::state::SatelliteState;
use crate::update_requester::UpdateRequester;
use crate::update_tracker::{UpdateBundle, UpdateTracker};
use crate::worker_pool::WorkerPool;
use slog::{debug, error, info, o, trace, warn, Logger};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use stormesh_common::access::{AccessContext, Privilege};
use stormesh_common::identity::{NodeName, ResourceName, StorPoolName};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceManagerState {
    NotYetRunning,
    WaitingForUpdates,
    RequestingUpdates,
    AwaitingConfirmation,
    AwaitingDeviceState,
    Dispatching,
    AwaitingHandlers { dispatched: usize },
    ShutDown,
    /// The loop could not start, or ended without being asked to; it will
    /// not run again
    Failed { reason: String },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceManagerStatus {
    pub state: DeviceManagerState,
    /// Number of the current cycle, counting from 0
    pub cycle: u64,
}

/// Objects whose requested updates were applied, grouped by kind
#[derive(Clone, Debug, Default)]
pub struct AppliedUpdates {
    pub nodes: BTreeSet<NodeName>,
    pub resource_definitions: BTreeSet<ResourceName>,
    pub stor_pools: BTreeSet<StorPoolName>,
    pub resources: BTreeMap<ResourceName, BTreeSet<NodeName>>,
}

#[derive(Debug, Default)]
struct SchedState {
    /// Requested updates that have not been applied yet
    rcv_pending: UpdateBundle,
    full_sync_applied: bool,
}

struct Shared {
    sched: Mutex<SchedState>,
    sched_notify: Notify,
    tracker: Arc<UpdateTracker>,
    device_state_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    abort: Arc<AtomicBool>,
    status_tx: watch::Sender<DeviceManagerStatus>,
}

/// Interface to a running device manager
///
/// Apply handlers report applied updates through the `*_applied` methods;
/// event sources report device state availability.
#[derive(Clone)]
pub struct DeviceManagerHandle {
    shared: Arc<Shared>,
}

impl DeviceManagerHandle {
    pub fn update_tracker(&self) -> &Arc<UpdateTracker> {
        &self.shared.tracker
    }

    pub fn status(&self) -> watch::Receiver<DeviceManagerStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Requested updates that have not been confirmed yet
    pub fn pending_confirmations(&self) -> UpdateBundle {
        self.shared.sched.lock().unwrap().rcv_pending.clone()
    }

    /// Records `bundle` as requested, as the loop does before it sends
    /// update requests
    #[cfg(test)]
    pub(crate) fn expect_confirmations(&self, bundle: &UpdateBundle) {
        let mut sched = self.shared.sched.lock().unwrap();
        bundle.copy_update_requests_to(&mut sched.rcv_pending);
    }

    fn confirm<F>(&self, f: F)
    where
        F: FnOnce(&mut UpdateBundle),
    {
        let now_empty = {
            let mut sched = self.shared.sched.lock().unwrap();
            f(&mut sched.rcv_pending);
            sched.rcv_pending.is_empty()
        };
        if now_empty {
            self.shared.sched_notify.notify_waiters();
        }
    }

    pub fn node_update_applied(
        &self,
        nodes: impl IntoIterator<Item = NodeName>,
    ) {
        self.confirm(|pending| {
            for node in nodes {
                pending.nodes.remove(&node);
            }
        });
    }

    pub fn resource_definition_update_applied(
        &self,
        rscs: impl IntoIterator<Item = ResourceName>,
    ) {
        self.confirm(|pending| {
            for rsc in rscs {
                pending.resource_definitions.remove(&rsc);
            }
        });
    }

    pub fn stor_pool_update_applied(
        &self,
        stor_pools: impl IntoIterator<Item = StorPoolName>,
    ) {
        self.confirm(|pending| {
            for stor_pool in stor_pools {
                pending.stor_pools.remove(&stor_pool);
            }
        });
    }

    pub fn resource_update_applied(
        &self,
        rscs: BTreeMap<ResourceName, BTreeSet<NodeName>>,
    ) {
        self.confirm(|pending| remove_resources(pending, rscs));
    }

    pub fn update_applied(&self, applied: AppliedUpdates) {
        self.confirm(|pending| {
            for node in applied.nodes {
                pending.nodes.remove(&node);
            }
            for rsc in applied.resource_definitions {
                pending.resource_definitions.remove(&rsc);
            }
            for stor_pool in applied.stor_pools {
                pending.stor_pools.remove(&stor_pool);
            }
            remove_resources(pending, applied.resources);
        });
    }

    /// Discards all outstanding expectations and schedules every locally
    /// known resource for the next cycle
    pub fn full_sync_applied(&self) {
        {
            let mut sched = self.shared.sched.lock().unwrap();
            sched.rcv_pending.clear();
            sched.full_sync_applied = true;
        }
        self.shared.sched_notify.notify_waiters();
    }

    /// Makes device handlers that have not started yet skip their work and
    /// stops dispatching further resources in the current cycle
    pub fn abort_device_handlers(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
    }

    pub fn device_state_available(&self) {
        self.shared.device_state_tx.send_replace(true);
    }

    pub fn device_state_unavailable(&self) {
        self.shared.device_state_tx.send_replace(false);
    }

    pub fn node_deleted(&self, node: &NodeName) {
        self.shared.tracker.forget_node(node);
        self.confirm(|pending| {
            pending.nodes.remove(node);
            for node_map in pending.resources.values_mut() {
                node_map.remove(node);
            }
            pending.resources.retain(|_, node_map| !node_map.is_empty());
        });
    }

    pub fn resource_definition_deleted(&self, rsc: &ResourceName) {
        self.shared.tracker.forget_resource_definition(rsc);
        self.confirm(|pending| {
            pending.resource_definitions.remove(rsc);
            pending.resources.remove(rsc);
        });
    }

    pub fn resource_deleted(&self, rsc: &ResourceName, node: &NodeName) {
        self.shared.tracker.forget_resource(rsc, node);
        self.confirm(|pending| {
            remove_resources(
                pending,
                BTreeMap::from([(rsc.clone(), BTreeSet::from([node.clone()]))]),
            )
        });
    }

    pub fn stor_pool_deleted(&self, stor_pool: &StorPoolName) {
        self.shared.tracker.forget_stor_pool(stor_pool);
        self.confirm(|pending| {
            pending.stor_pools.remove(stor_pool);
        });
    }

    /// Asks the loop to stop at its next suspension point
    ///
    /// Device handlers that have not started yet are skipped.
    pub fn shutdown(&self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.shared.shutdown_tx.send_replace(true);
    }
}

fn remove_resources(
    pending: &mut UpdateBundle,
    rscs: BTreeMap<ResourceName, BTreeSet<NodeName>>,
) {
    for (rsc, nodes) in rscs {
        if let Some(node_map) = pending.resources.get_mut(&rsc) {
            for node in &nodes {
                node_map.remove(node);
            }
            if node_map.is_empty() {
                pending.resources.remove(&rsc);
            }
        }
    }
}

/// Starts the reconciliation loop on its own tokio task
///
/// `ctx` must be able to enable [`Privilege::SysAll`].  If it cannot, the loop
/// reports [`DeviceManagerState::Failed`] and exits immediately.
pub fn spawn<H: DeviceHandler>(
    log: &Logger,
    config: &DeviceManagerConfig,
    ctx: AccessContext,
    tracker: Arc<UpdateTracker>,
    state: Arc<SatelliteState>,
    requester: UpdateRequester,
    handler: Arc<H>,
) -> DeviceManagerHandle {
    let log = log.new(o!("component" => "DeviceManager"));
    let (device_state_tx, device_state_rx) = watch::channel(false);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (status_tx, _) = watch::channel(DeviceManagerStatus {
        state: DeviceManagerState::NotYetRunning,
        cycle: 0,
    });
    let shared = Arc::new(Shared {
        sched: Mutex::new(SchedState::default()),
        sched_notify: Notify::new(),
        tracker,
        device_state_tx,
        shutdown_tx,
        abort: Arc::new(AtomicBool::new(false)),
        status_tx,
    });

    let task = DeviceManagerTask {
        pool: WorkerPool::new(&log, config.max_parallel_handlers),
        log,
        ctx,
        shared: Arc::clone(&shared),
        state,
        requester,
        handler,
        barrier: PhaseBarrier::new(),
        shutdown_rx,
        device_state_rx,
        cycle: 0,
    };
    tokio::spawn(task.run());

    DeviceManagerHandle { shared }
}

/// Publishes the end of the loop on every way out of its task, including a
/// panic
struct ExitGuard {
    log: Logger,
    shared: Arc<Shared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.shared.abort.store(true, Ordering::SeqCst);
        self.shared.shutdown_tx.send_replace(true);
        let log = &self.log;
        self.shared.status_tx.send_if_modified(|status| match status.state {
            DeviceManagerState::ShutDown | DeviceManagerState::Failed { .. } => {
                false
            }
            _ => {
                error!(
                    log,
                    "device manager exited unexpectedly";
                    "cycle" => status.cycle,
                );
                status.state = DeviceManagerState::Failed {
                    reason: String::from("device manager exited unexpectedly"),
                };
                true
            }
        });
    }
}

enum Woken {
    Updates(UpdateBundle),
    FullSync,
}

struct DeviceManagerTask<H> {
    log: Logger,
    ctx: AccessContext,
    shared: Arc<Shared>,
    state: Arc<SatelliteState>,
    requester: UpdateRequester,
    handler: Arc<H>,
    barrier: PhaseBarrier,
    pool: WorkerPool,
    shutdown_rx: watch::Receiver<bool>,
    device_state_rx: watch::Receiver<bool>,
    cycle: u64,
}

impl<H: DeviceHandler> DeviceManagerTask<H> {
    async fn run(mut self) {
        let _exit_guard = ExitGuard {
            log: self.log.clone(),
            shared: Arc::clone(&self.shared),
        };
        if let Err(err) = self.ctx.enable_privileges([Privilege::SysAll]) {
            error!(
                self.log,
                "device manager was started with an access context that \
                 cannot access all required information";
                "error" => %err,
            );
            self.shared.shutdown_tx.send_replace(true);
            self.set_state(DeviceManagerState::Failed {
                reason: err.to_string(),
            });
            return;
        }

        info!(self.log, "device manager started");
        let mut dispatch = BTreeSet::new();
        loop {
            debug!(self.log, "begin cycle"; "cycle" => self.cycle);
            let result = self.run_cycle(&mut dispatch).await;
            debug!(self.log, "end cycle"; "cycle" => self.cycle);
            if let Err(ShutdownRequested) = result {
                break;
            }
            self.cycle += 1;
        }

        self.shared.abort.store(true, Ordering::SeqCst);
        self.pool.abort_all();
        self.set_state(DeviceManagerState::ShutDown);
        info!(self.log, "device manager stopped");
    }

    fn set_state(&self, state: DeviceManagerState) {
        self.shared
            .status_tx
            .send_replace(DeviceManagerStatus { state, cycle: self.cycle });
    }

    fn take_full_sync_flag(&self) -> bool {
        std::mem::take(&mut self.shared.sched.lock().unwrap().full_sync_applied)
    }

    async fn run_cycle(
        &mut self,
        dispatch: &mut BTreeSet<ResourceName>,
    ) -> Result<(), ShutdownRequested> {
        dispatch.clear();

        match self.wait_for_updates().await? {
            Woken::FullSync => {
                trace!(self.log, "running device handlers after full sync");
                dispatch.extend(self.state.resource_names());
                dispatch.extend(self.state.deleted_resource_names());
            }
            Woken::Updates(bundle) => {
                self.set_state(DeviceManagerState::RequestingUpdates);
                // Receipt of updates races with sending the requests, so the
                // expectations must be in place before anything is sent.
                {
                    let mut sched = self.shared.sched.lock().unwrap();
                    bundle.copy_update_requests_to(&mut sched.rcv_pending);
                }
                dispatch.extend(bundle.affected_resources());

                let failed = self.requester.request_updates(&bundle);
                if failed > 0 {
                    warn!(
                        self.log,
                        "some update requests could not be sent";
                        "failed" => failed,
                    );
                }

                self.set_state(DeviceManagerState::AwaitingConfirmation);
                self.wait_for_confirmations().await?;
            }
        }

        // Checks that arrived while waiting for confirmations are handled in
        // this cycle.
        dispatch.extend(self.shared.tracker.take_check_resources().into_keys());

        self.wait_for_device_state().await?;
        self.dispatch(dispatch).await
    }

    async fn wait_for_updates(&mut self) -> Result<Woken, ShutdownRequested> {
        let shared = Arc::clone(&self.shared);
        self.set_state(DeviceManagerState::WaitingForUpdates);
        trace!(self.log, "collecting update notifications");
        loop {
            let notified = shared.sched_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.take_full_sync_flag() {
                return Ok(Woken::FullSync);
            }

            let mut bundle = UpdateBundle::default();
            tokio::select! {
                result = shared.tracker.collect_update_notifications(
                    &mut bundle,
                    &mut self.shutdown_rx,
                ) => {
                    result?;
                    return Ok(Woken::Updates(bundle));
                }
                _ = &mut notified => {}
            }
        }
    }

    async fn wait_for_confirmations(&mut self) -> Result<(), ShutdownRequested> {
        let shared = Arc::clone(&self.shared);
        let mut logged = false;
        loop {
            let notified = shared.sched_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutdown::is_requested(&mut self.shutdown_rx) {
                return Err(ShutdownRequested);
            }
            if shared.sched.lock().unwrap().rcv_pending.is_empty() {
                trace!(self.log, "all requested updates were applied");
                return Ok(());
            }
            if !logged {
                trace!(self.log, "waiting for requested updates to be applied");
                logged = true;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown::requested(&mut self.shutdown_rx) => {
                    return Err(ShutdownRequested);
                }
            }
        }
    }

    async fn wait_for_device_state(&mut self) -> Result<(), ShutdownRequested> {
        if shutdown::is_requested(&mut self.shutdown_rx) {
            return Err(ShutdownRequested);
        }
        if *self.device_state_rx.borrow_and_update() {
            return Ok(());
        }

        self.set_state(DeviceManagerState::AwaitingDeviceState);
        debug!(self.log, "waiting for device state tracking to become available");
        tokio::select! {
            // The sender lives in `shared`, which outlives this task.
            _ = self.device_state_rx.wait_for(|available| *available) => {
                Ok(())
            }
            _ = shutdown::requested(&mut self.shutdown_rx) => {
                Err(ShutdownRequested)
            }
        }
    }

    async fn dispatch(
        &mut self,
        dispatch: &BTreeSet<ResourceName>,
    ) -> Result<(), ShutdownRequested> {
        self.set_state(DeviceManagerState::Dispatching);
        trace!(self.log, "dispatching resources to device handlers");

        // Registering the loop first keeps the phase from advancing while
        // handlers are still being added.
        let phase = self.barrier.register();
        let abort = &self.shared.abort;
        abort.store(false, Ordering::SeqCst);

        let mut dispatched = 0;
        let mut deleted = Vec::new();
        for (index, rsc_name) in dispatch.iter().enumerate() {
            if abort.load(Ordering::SeqCst) {
                warn!(
                    self.log,
                    "device handler dispatch aborted";
                    "remaining" => dispatch.len() - index,
                );
                break;
            }
            let (resource, kind) = match self.state.resource(rsc_name) {
                Some(resource) => (resource, DispatchKind::Converge),
                None => match self.state.deleted_resource(rsc_name) {
                    Some(resource) => {
                        deleted.push((
                            rsc_name.clone(),
                            resource.definition.uuid,
                        ));
                        (resource, DispatchKind::Delete)
                    }
                    None => {
                        warn!(
                            self.log,
                            "dispatch request for a resource unknown to this \
                             satellite";
                            "resource" => %rsc_name,
                        );
                        continue;
                    }
                },
            };
            let invocation = DeviceHandlerInvocation::new(
                &self.log,
                Arc::clone(&self.handler),
                resource,
                kind,
                Arc::clone(abort),
                self.barrier.register_arrival(),
            );
            self.pool.submit(invocation.run());
            dispatched += 1;
        }

        self.barrier.arrive_and_deregister();
        self.set_state(DeviceManagerState::AwaitingHandlers { dispatched });
        tokio::select! {
            _ = self.barrier.await_advance(phase) => {}
            _ = shutdown::requested(&mut self.shutdown_rx) => {
                return Err(ShutdownRequested);
            }
        }
        self.pool.reap().await;
        debug!(
            self.log,
            "all device handlers of this cycle finished";
            "dispatched" => dispatched,
            "phase" => phase,
        );
        self.cleanup_deleted(deleted);
        Ok(())
    }

    fn cleanup_deleted(&self, deleted: Vec<(ResourceName, Uuid)>) {
        if self.shared.abort.load(Ordering::SeqCst) {
            // Aborted handlers may have skipped the teardown.
            for (rsc_name, dfn_uuid) in deleted {
                self.shared.tracker.check_resource(rsc_name, dfn_uuid);
            }
            return;
        }
        for (rsc_name, _) in deleted {
            if self.state.forget_deleted_resource(&rsc_name).is_some() {
                debug!(
                    self.log,
                    "forgot deleted resource";
                    "resource" => %rsc_name,
                );
            }
        }
    }
}
