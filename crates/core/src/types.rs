//! Wall-clock stamps shared by every request and event.

use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// SDK version reported with every request.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// App version reported when the host does not supply one.
pub const DEFAULT_APP_VERSION: &str = "1.0";

/// The moment a request or event was produced, as the collector expects it:
/// epoch seconds plus the device-local hour and day of week.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestTime {
    pub timestamp: i64,
    /// Device-local hour, 0-23.
    pub hour: u32,
    /// Device-local day of week, 0 = Sunday .. 6 = Saturday.
    pub dow: u32,
}

impl RequestTime {
    pub fn now() -> Self {
        Self::from_datetime(&Local::now())
    }

    pub fn from_datetime<Tz: TimeZone>(at: &DateTime<Tz>) -> Self {
        Self {
            timestamp: at.timestamp(),
            hour: at.hour(),
            dow: at.weekday().num_days_from_sunday(),
        }
    }
}
