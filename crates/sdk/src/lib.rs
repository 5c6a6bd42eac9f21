//! Client-side telemetry SDK: session tracking, custom events and crash
//! reports, queued durably and delivered in order to a collector.

pub mod context;
pub mod crash;
pub mod delivery;
pub mod device;
pub mod events;
pub mod messaging;
pub mod queue;
pub mod referrer;
pub mod requests;
pub mod sessions;
pub mod store;
pub mod user;

pub use context::{Pulse, PulseBuilder};
pub use delivery::{BlockReason, DeliveryState};
pub use device::{DeviceIdStrategy, DeviceMetrics, StrategyKind};
pub use events::Segmentation;
pub use messaging::{MessagingCapability, MessagingMode};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use user::UserProfile;
