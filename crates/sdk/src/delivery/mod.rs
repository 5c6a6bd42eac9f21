//! Delivery of queued requests to the collector.
//!
//! The [`DeliveryScheduler`] keeps at most one [`DeliveryWorker`] run alive.
//! A run drains the queue oldest first and stops at the first failure,
//! leaving that entry and everything behind it for the next trigger.

mod scheduler;
mod transport;
mod worker;

pub use scheduler::{BlockReason, DeliveryScheduler, DeliveryState};
pub use transport::{DeliveryError, Transport};
pub use worker::{DeliveryWorker, RunOutcome};
