use parking_lot::Mutex;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::worker::{DeliveryWorker, RunOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    AwaitingIdentity,
    DeliveryFailed,
}

/// Observable state of the delivery pipeline. `Blocked` holds until the next
/// [`DeliveryScheduler::tick`] starts another run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Draining,
    Blocked(BlockReason),
}

impl From<RunOutcome> for DeliveryState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Drained { .. } => Self::Idle,
            RunOutcome::AwaitingIdentity { .. } => Self::Blocked(BlockReason::AwaitingIdentity),
            RunOutcome::Failed { .. } => Self::Blocked(BlockReason::DeliveryFailed),
        }
    }
}

/// Single-slot executor for worker runs.
pub struct DeliveryScheduler {
    worker: Arc<DeliveryWorker>,
    runtime: Handle,
    slot: Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<DeliveryState>,
}

impl DeliveryScheduler {
    pub fn new(worker: DeliveryWorker, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            worker: Arc::new(worker),
            runtime,
            slot: Mutex::new(None),
            state: watch::Sender::new(DeliveryState::Idle),
        })
    }

    pub fn state(&self) -> DeliveryState {
        *self.state.borrow()
    }

    /// Starts a worker run unless the queue is empty or a run is in flight.
    /// Returns whether a run was started.
    pub fn tick(self: &Arc<Self>) -> bool {
        if !self.worker.has_pending() {
            return false;
        }

        let mut slot = self.slot.lock();
        let in_flight = slot.as_ref().is_some_and(|handle| !handle.is_finished())
            && self.state() == DeliveryState::Draining;
        if in_flight {
            debug!("delivery run already in flight");
            return false;
        }

        self.state.send_replace(DeliveryState::Draining);
        let scheduler = Arc::clone(self);
        *slot = Some(self.runtime.spawn(async move {
            loop {
                let outcome = scheduler.worker.run().await;
                let _slot = scheduler.slot.lock();
                // Work enqueued after the worker saw an empty queue would
                // otherwise wait for the next trigger.
                if matches!(outcome, RunOutcome::Drained { .. }) && scheduler.worker.has_pending() {
                    continue;
                }
                scheduler.state.send_replace(outcome.into());
                break;
            }
        }));
        true
    }

    /// Resolves once no run is in flight.
    pub async fn settle(&self) -> DeliveryState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(|state| *state != DeliveryState::Draining).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        settled
    }

    /// Forgets a blocked state after the queue was discarded.
    pub fn reset(&self) {
        let _slot = self.slot.lock();
        if self.state() != DeliveryState::Draining {
            self.state.send_replace(DeliveryState::Idle);
        }
    }
}
