// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A generation-counted barrier with a dynamic number of parties
//!
//! Parties may register at any time, including while a phase is in progress.
//! When the last registered party arrives (and deregisters), the phase number
//! advances and everyone waiting on the old phase is released.  The barrier
//! never terminates: once it has advanced, parties can register for the new
//! phase.
//!
//! The device manager registers itself before dispatching device handlers so
//! the phase cannot advance while handlers are still being discovered, then
//! arrives once dispatch is done and waits for the advance.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;

#[derive(Debug)]
struct BarrierState {
    phase: u64,
    parties: usize,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<BarrierState>,
    phase_tx: watch::Sender<u64>,
}

#[derive(Clone, Debug)]
pub struct PhaseBarrier {
    inner: Arc<Inner>,
}

impl Default for PhaseBarrier {
    fn default() -> Self {
        PhaseBarrier::new()
    }
}

impl PhaseBarrier {
    pub fn new() -> PhaseBarrier {
        let (phase_tx, _) = watch::channel(0);
        PhaseBarrier {
            inner: Arc::new(Inner {
                state: Mutex::new(BarrierState { phase: 0, parties: 0 }),
                phase_tx,
            }),
        }
    }

    pub fn phase(&self) -> u64 {
        self.inner.state.lock().unwrap().phase
    }

    pub fn registered_parties(&self) -> usize {
        self.inner.state.lock().unwrap().parties
    }

    /// Adds a party to the current phase and returns that phase
    pub fn register(&self) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        state.parties += 1;
        state.phase
    }

    /// Registers a party that arrives when the returned guard is dropped
    pub fn register_arrival(&self) -> PhaseArrival {
        let phase = self.register();
        PhaseArrival { barrier: self.clone(), phase, arrived: false }
    }

    /// Removes one party from the current phase, advancing the phase if it
    /// was the last one
    ///
    /// Returns the phase the caller arrived at.
    pub fn arrive_and_deregister(&self) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        let arrived_at = state.phase;
        assert!(state.parties > 0, "arrival at a barrier without parties");
        state.parties -= 1;
        if state.parties == 0 {
            state.phase += 1;
            self.inner.phase_tx.send_replace(state.phase);
        }
        arrived_at
    }

    /// Waits until the barrier has advanced past `phase`
    ///
    /// Returns the new phase.  Cancel-safe.
    pub async fn await_advance(&self, phase: u64) -> u64 {
        let mut rx = self.inner.phase_tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let next = match rx.wait_for(|current| *current != phase).await {
            Ok(current) => *current,
            Err(_) => self.phase(),
        };
        next
    }
}

/// A registered party that arrives at its barrier when dropped
///
/// Dropping happens on every exit path of the holder, including panics, so
/// the barrier cannot be left waiting for a party that is gone.
#[derive(Debug)]
pub struct PhaseArrival {
    barrier: PhaseBarrier,
    phase: u64,
    arrived: bool,
}

impl PhaseArrival {
    /// The phase this party registered for
    pub fn phase(&self) -> u64 {
        self.phase
    }

    pub fn arrive(mut self) {
        self.arrive_once();
    }

    fn arrive_once(&mut self) {
        if !self.arrived {
            self.arrived = true;
            self.barrier.arrive_and_deregister();
        }
    }
}

impl Drop for PhaseArrival {
    fn drop(&mut self) {
        self.arrive_once();
    }
}
