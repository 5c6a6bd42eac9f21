//! Event model and the durable event buffer that batches custom events
//! before they become a `record_events` request.

use parking_lot::Mutex;
use pulse_core::{PulseError, PulseResult, RequestTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::store::{keys, KeyValueStore};

/// Breakdown dimensions attached to an event.
pub type Segmentation = BTreeMap<String, String>;

/// One recorded occurrence of an application-defined metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub segmentation: Segmentation,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
    pub timestamp: i64,
    pub hour: u32,
    pub dow: u32,
}

impl Event {
    pub fn new(
        at: RequestTime,
        key: impl Into<String>,
        segmentation: Segmentation,
        count: u32,
        sum: Option<f64>,
    ) -> Self {
        Self {
            key: key.into(),
            segmentation,
            count,
            // NaN and infinities cannot be represented on the wire.
            sum: sum.filter(|s| s.is_finite()),
            timestamp: at.timestamp,
            hour: at.hour,
            dow: at.dow,
        }
    }
}

// Identity is key, time and segmentation; count and sum do not take part.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.timestamp == other.timestamp
            && self.hour == other.hour
            && self.dow == other.dow
            && self.segmentation == other.segmentation
    }
}

impl Eq for Event {}

/// Rejects an event before it can reach the buffer.
pub fn validate_event(key: &str, segmentation: &Segmentation, count: u32) -> PulseResult<()> {
    if key.is_empty() {
        return Err(PulseError::validation("a valid event key is required"));
    }
    if count < 1 {
        return Err(PulseError::validation("event count should be greater than zero"));
    }
    for (seg_key, seg_value) in segmentation {
        if seg_key.is_empty() {
            return Err(PulseError::validation(
                "event segmentation key cannot be empty",
            ));
        }
        if seg_value.is_empty() {
            return Err(PulseError::validation(format!(
                "event segmentation value for {seg_key:?} cannot be empty"
            )));
        }
    }
    Ok(())
}

/// Durable list of events not yet handed to the request builder.
pub struct EventBuffer {
    store: Arc<dyn KeyValueStore>,
    guard: Mutex<()>,
}

impl EventBuffer {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            guard: Mutex::new(()),
        }
    }

    fn load(&self) -> PulseResult<Vec<Event>> {
        let Some(raw) = self.store.get(keys::EVENTS)? else {
            return Ok(Vec::new());
        };
        let stored: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let mut events = Vec::with_capacity(stored.len());
        for value in stored {
            match serde_json::from_value::<Event>(value) {
                Ok(event) if !event.key.is_empty() => events.push(event),
                Ok(_) => {
                    metrics::counter!("pulse.events.dropped").increment(1);
                    warn!("dropping stored event without a key");
                }
                Err(e) => {
                    metrics::counter!("pulse.events.dropped").increment(1);
                    warn!(error = %e, "dropping unreadable stored event");
                }
            }
        }
        Ok(events)
    }

    fn save(&self, events: &[Event]) -> PulseResult<()> {
        self.store.put(keys::EVENTS, &serde_json::to_string(events)?)
    }

    pub fn record(
        &self,
        key: &str,
        segmentation: Segmentation,
        count: u32,
        sum: Option<f64>,
    ) -> PulseResult<()> {
        self.record_at(RequestTime::now(), key, segmentation, count, sum)
    }

    pub fn record_at(
        &self,
        at: RequestTime,
        key: &str,
        segmentation: Segmentation,
        count: u32,
        sum: Option<f64>,
    ) -> PulseResult<()> {
        validate_event(key, &segmentation, count)?;
        let event = Event::new(at, key, segmentation, count, sum);

        let _guard = self.guard.lock();
        let mut events = self.load()?;
        events.push(event);
        self.save(&events)?;
        debug!(key = key, buffered = events.len(), "event recorded");
        Ok(())
    }

    pub fn size(&self) -> PulseResult<usize> {
        let _guard = self.guard.lock();
        Ok(self.load()?.len())
    }

    /// Snapshots and clears the buffer in one step, returning the
    /// URL-encoded JSON array of everything that was in it.
    pub fn drain(&self) -> PulseResult<String> {
        let _guard = self.guard.lock();
        let batch = self.render_locked()?;
        self.store.remove(keys::EVENTS)?;
        Ok(batch)
    }

    /// Same batch as [`EventBuffer::drain`], leaving the buffer untouched.
    pub fn batch(&self) -> PulseResult<String> {
        let _guard = self.guard.lock();
        self.render_locked()
    }

    fn render_locked(&self) -> PulseResult<String> {
        let events = self.load()?;
        let mut batch = Vec::with_capacity(events.len());
        for event in &events {
            match serde_json::to_value(event) {
                Ok(value) => batch.push(value),
                Err(e) => {
                    metrics::counter!("pulse.events.dropped").increment(1);
                    warn!(key = %event.key, error = %e, "event excluded from batch");
                }
            }
        }
        let json = serde_json::to_string(&batch)?;
        if !events.is_empty() {
            info!(count = batch.len(), "rendered event batch");
        }
        Ok(form_urlencoded::byte_serialize(json.as_bytes()).collect())
    }

    pub fn clear(&self) -> PulseResult<()> {
        let _guard = self.guard.lock();
        self.store.remove(keys::EVENTS)
    }
}
