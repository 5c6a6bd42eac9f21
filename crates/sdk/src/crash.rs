//! Crash and error reports.

use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt::Write as _;

use crate::device::DeviceMetrics;

/// Breadcrumbs kept in memory before a crash and the most recent ones sent.
const MAX_BREADCRUMBS: usize = 100;

/// Context collected ahead of a crash and attached to every report.
#[derive(Debug, Clone, Default)]
pub struct CrashContext {
    logs: Vec<String>,
    custom: BTreeMap<String, String>,
}

impl CrashContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_log(&mut self, record: impl Into<String>) {
        if self.logs.len() == MAX_BREADCRUMBS {
            self.logs.remove(0);
        }
        self.logs.push(record.into());
    }

    pub fn set_custom_segments(&mut self, segments: BTreeMap<String, String>) {
        self.custom = segments;
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn custom(&self) -> &BTreeMap<String, String> {
        &self.custom
    }

    /// Breadcrumbs are per-report; they are not resent with the next crash.
    pub fn take_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.logs)
    }
}

/// JSON body of a `crash=` payload.
#[derive(Debug, Clone, Serialize)]
pub struct CrashReport {
    #[serde(rename = "_error")]
    pub error: String,
    #[serde(rename = "_nonfatal")]
    pub nonfatal: bool,
    #[serde(rename = "_logs")]
    pub logs: String,
    #[serde(rename = "_background")]
    pub background: bool,
    #[serde(rename = "_custom", skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
    #[serde(flatten)]
    pub metrics: DeviceMetrics,
}

impl CrashReport {
    pub fn new(trace: &str, nonfatal: bool, metrics: &DeviceMetrics) -> Self {
        Self {
            error: trace.to_string(),
            nonfatal,
            logs: String::new(),
            background: false,
            custom: BTreeMap::new(),
            metrics: metrics.clone(),
        }
    }

    /// Non-fatal report for an error value; the source chain becomes the trace.
    pub fn from_error(error: &(dyn StdError + 'static), metrics: &DeviceMetrics) -> Self {
        Self::new(&render_chain(error), true, metrics)
    }

    pub fn with_context(mut self, logs: Vec<String>, custom: &BTreeMap<String, String>) -> Self {
        self.logs = logs.join("\n");
        self.custom = custom.clone();
        self
    }

    pub fn in_background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }
}

fn render_chain(error: &(dyn StdError + 'static)) -> String {
    let mut trace = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let _ = write!(trace, "\ncaused by: {cause}");
        source = cause.source();
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("request failed")]
    struct Outer(#[source] std::io::Error);

    #[test]
    fn test_report_fields() {
        let mut context = CrashContext::new();
        context.add_log("opened settings");
        context.add_log("tapped save");
        context.set_custom_segments(BTreeMap::from([("build".to_string(), "42".to_string())]));

        let metrics = DeviceMetrics {
            os: Some("linux".into()),
            ..Default::default()
        };
        let report = CrashReport::new("panic at main.rs:3", false, &metrics)
            .with_context(context.take_logs(), context.custom())
            .in_background(true);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["_error"], "panic at main.rs:3");
        assert_eq!(json["_nonfatal"], false);
        assert_eq!(json["_logs"], "opened settings\ntapped save");
        assert_eq!(json["_background"], true);
        assert_eq!(json["_custom"]["build"], "42");
        assert_eq!(json["_os"], "linux");
        assert!(context.logs().is_empty());
    }

    #[test]
    fn test_error_chain_is_rendered() {
        let error = Outer(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let report = CrashReport::from_error(&error, &DeviceMetrics::default());
        assert!(report.nonfatal);
        assert_eq!(report.error, "request failed\ncaused by: disk full");
    }

    #[test]
    fn test_breadcrumbs_are_bounded() {
        let mut context = CrashContext::new();
        for i in 0..(MAX_BREADCRUMBS + 5) {
            context.add_log(format!("step {i}"));
        }
        assert_eq!(context.logs().len(), MAX_BREADCRUMBS);
        assert_eq!(context.logs()[0], "step 5");
    }
}
