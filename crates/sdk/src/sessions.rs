//! Session tracking. Turns foreground-activity counts into session
//! lifecycle signals and keeps the current view for view-duration events.

use pulse_core::{PulseError, PulseResult};
use std::time::{Duration, Instant};

use crate::events::Segmentation;

/// Event key the collector uses for view events.
pub const VIEW_EVENT_KEY: &str = "[CLY]_view";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Inactive,
    Active,
}

/// What an activity stop meant for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Other activities are still in the foreground.
    StillActive,
    /// The last activity stopped; carries the unreported duration in seconds.
    Ended { duration_secs: u64 },
}

/// State machine over the number of foreground activities.
///
/// `Inactive -> Active` happens exactly on 0 -> 1, `Active -> Inactive` on
/// N -> 0. Durations are measured on the monotonic clock from the last
/// checkpoint, which every report moves forward.
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    activity_count: u32,
    checkpoint: Option<Instant>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        if self.activity_count > 0 {
            SessionPhase::Active
        } else {
            SessionPhase::Inactive
        }
    }

    pub fn activity_count(&self) -> u32 {
        self.activity_count
    }

    /// Returns `true` when this start opened a new session.
    pub fn activity_started(&mut self, now: Instant) -> bool {
        self.activity_count += 1;
        if self.activity_count == 1 {
            self.checkpoint = Some(now);
            return true;
        }
        false
    }

    pub fn activity_stopped(&mut self, now: Instant) -> PulseResult<StopOutcome> {
        if self.activity_count == 0 {
            return Err(PulseError::validation(
                "activity stopped without a matching start",
            ));
        }
        self.activity_count -= 1;
        if self.activity_count > 0 {
            return Ok(StopOutcome::StillActive);
        }
        let duration_secs = self.take_elapsed(now);
        self.checkpoint = None;
        Ok(StopOutcome::Ended { duration_secs })
    }

    /// Seconds to report on a heartbeat, or `None` while inactive.
    pub fn heartbeat(&mut self, now: Instant) -> Option<u64> {
        match self.phase() {
            SessionPhase::Active => Some(self.take_elapsed(now)),
            SessionPhase::Inactive => None,
        }
    }

    /// Rounded seconds since the last checkpoint; moves the checkpoint to `now`.
    pub fn take_elapsed(&mut self, now: Instant) -> u64 {
        let elapsed = self
            .checkpoint
            .map(|checkpoint| now.saturating_duration_since(checkpoint))
            .unwrap_or(Duration::ZERO);
        if self.checkpoint.is_some() {
            self.checkpoint = Some(now);
        }
        elapsed.as_secs_f64().round() as u64
    }

    pub fn reset(&mut self) {
        self.activity_count = 0;
        self.checkpoint = None;
    }
}

/// Tracks the view currently on screen.
#[derive(Debug, Clone)]
pub struct ViewTracker {
    current: Option<(String, i64)>,
    first_view_pending: bool,
    segment: String,
}

impl ViewTracker {
    /// `first_view_pending` is false once the install has recorded a view.
    pub fn new(segment: impl Into<String>, first_view_pending: bool) -> Self {
        Self {
            current: None,
            first_view_pending,
            segment: segment.into(),
        }
    }

    pub fn current_view(&self) -> Option<&str> {
        self.current.as_ref().map(|(name, _)| name.as_str())
    }

    pub fn is_first_view_pending(&self) -> bool {
        self.first_view_pending
    }

    /// Closes the previous view and opens `name`. Returns the segmentations
    /// of the view events to record, in order.
    pub fn record_view(&mut self, name: &str, now_ts: i64) -> Vec<Segmentation> {
        let mut emitted = Vec::with_capacity(2);
        if let Some(closing) = self.close(now_ts) {
            emitted.push(closing);
        }

        let mut opening = Segmentation::from([
            ("name".to_string(), name.to_string()),
            ("visit".to_string(), "1".to_string()),
            ("segment".to_string(), self.segment.clone()),
        ]);
        if self.first_view_pending {
            self.first_view_pending = false;
            opening.insert("start".to_string(), "1".to_string());
        }
        emitted.push(opening);

        self.current = Some((name.to_string(), now_ts));
        emitted
    }

    /// Duration event for the current view, if any; the view is cleared.
    pub fn close(&mut self, now_ts: i64) -> Option<Segmentation> {
        let (name, started) = self.current.take()?;
        let duration = (now_ts - started).max(0);
        Some(Segmentation::from([
            ("name".to_string(), name),
            ("dur".to_string(), duration.to_string()),
            ("segment".to_string(), self.segment.clone()),
        ]))
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}
