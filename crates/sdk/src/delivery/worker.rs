use pulse_core::{PulseError, PulseResult};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::transport::Transport;
use crate::device::DeviceIdentity;
use crate::queue::PendingQueue;

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue is empty.
    Drained { sent: usize },
    /// No device id yet; nothing after `sent` was attempted.
    AwaitingIdentity { sent: usize },
    /// The oldest entry could not be delivered and stays at the head.
    Failed { sent: usize },
}

/// One drain pass over the pending queue.
pub struct DeliveryWorker {
    queue: Arc<PendingQueue>,
    identity: Arc<DeviceIdentity>,
    transport: Transport,
}

impl DeliveryWorker {
    pub fn new(queue: Arc<PendingQueue>, identity: Arc<DeviceIdentity>, transport: Transport) -> Self {
        Self {
            queue,
            identity,
            transport,
        }
    }

    pub fn has_pending(&self) -> bool {
        match self.queue.is_empty() {
            Ok(empty) => !empty,
            Err(e) => {
                warn!(error = %e, "failed to read pending queue");
                false
            }
        }
    }

    /// Runs a queue operation on the blocking pool; queue writes sync the
    /// store to disk.
    async fn with_queue<T: Send + 'static>(
        &self,
        op: impl FnOnce(&PendingQueue) -> PulseResult<T> + Send + 'static,
    ) -> PulseResult<T> {
        let queue = Arc::clone(&self.queue);
        match tokio::task::spawn_blocking(move || op(&queue)).await {
            Ok(result) => result,
            Err(e) => Err(PulseError::storage(format!("queue task failed: {e}"))),
        }
    }

    /// Sends the oldest entry until the queue is empty or an attempt fails.
    /// A failure leaves that entry and every later one in place.
    pub async fn run(&self) -> RunOutcome {
        let mut sent = 0;
        loop {
            let request = match self.with_queue(|queue| queue.oldest()).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    if sent > 0 {
                        info!(sent, "pending queue drained");
                    }
                    return RunOutcome::Drained { sent };
                }
                Err(e) => {
                    error!(error = %e, "failed to read pending queue");
                    return RunOutcome::Failed { sent };
                }
            };

            let Some(device_id) = self.identity.id() else {
                debug!("device id not resolved yet, delivery deferred");
                return RunOutcome::AwaitingIdentity { sent };
            };

            if let Err(e) = self.transport.send(&request, &device_id).await {
                metrics::counter!("pulse.delivery.failed").increment(1);
                warn!(error = %e, "delivery attempt failed, queue blocked until next trigger");
                return RunOutcome::Failed { sent };
            }

            metrics::counter!("pulse.delivery.sent").increment(1);
            sent += 1;
            let delivered = request.clone();
            if let Err(e) = self
                .with_queue(move |queue| queue.remove_exact(&delivered))
                .await
            {
                // The entry was delivered but is still queued; it will be
                // sent again on the next run.
                error!(error = %e, "failed to remove delivered request");
                return RunOutcome::Failed { sent };
            }
        }
    }
}
