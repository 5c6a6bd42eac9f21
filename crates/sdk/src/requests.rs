//! Request builder. Turns SDK actions into the collector's query-string
//! payloads. Every payload carries `app_key`, `timestamp`, `hour`, `dow` and
//! `sdk_version`; `device_id` is appended at send time by the worker.

use pulse_core::types::SDK_VERSION;
use pulse_core::{PulseResult, RequestTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::form_urlencoded;

use crate::crash::CrashReport;
use crate::device::DeviceMetrics;
use crate::messaging::MessagingMode;
use crate::referrer::InstallReferrer;
use crate::user::UserProfile;

/// Query parameter naming a local file to upload with the request.
pub const PICTURE_PATH_PARAM: &str = "picturePath";
const CRASH_PARAM: &str = "crash";

/// A fully built payload waiting in the queue. Opaque to everything but
/// the delivery worker, which only inspects it to pick the HTTP framing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PendingRequest(String);

impl PendingRequest {
    pub fn new(payload: impl Into<String>) -> Self {
        Self(payload.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// First value of a query parameter, decoded.
    pub fn param(&self, name: &str) -> Option<String> {
        form_urlencoded::parse(self.0.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Crash payloads are too large for a query string and go out as POST.
    pub fn is_crash_report(&self) -> bool {
        self.param(CRASH_PARAM).is_some()
    }

    pub fn picture_path(&self) -> Option<String> {
        self.param(PICTURE_PATH_PARAM).filter(|p| !p.is_empty())
    }
}

impl fmt::Display for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One-shot location attached to the next session update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    fn to_param(self) -> String {
        format!("{},{}", self.latitude, self.longitude)
    }
}

type Query = form_urlencoded::Serializer<'static, String>;

/// Stateless payload construction for one app key.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    app_key: String,
}

impl RequestBuilder {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
        }
    }

    fn base(&self, at: RequestTime) -> Query {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query
            .append_pair("app_key", &self.app_key)
            .append_pair("timestamp", &at.timestamp.to_string())
            .append_pair("hour", &at.hour.to_string())
            .append_pair("dow", &at.dow.to_string())
            .append_pair("sdk_version", SDK_VERSION);
        query
    }

    pub fn begin_session(
        &self,
        at: RequestTime,
        metrics: &DeviceMetrics,
    ) -> PulseResult<PendingRequest> {
        let mut query = self.base(at);
        query
            .append_pair("begin_session", "1")
            .append_pair("metrics", &serde_json::to_string(metrics)?);
        Ok(PendingRequest(query.finish()))
    }

    /// Returns `None` when there is nothing to report: no elapsed time and
    /// no pending location.
    pub fn update_session(
        &self,
        at: RequestTime,
        duration_secs: u64,
        location: Option<Location>,
    ) -> Option<PendingRequest> {
        if duration_secs == 0 && location.is_none() {
            return None;
        }
        let mut query = self.base(at);
        if duration_secs > 0 {
            query.append_pair("session_duration", &duration_secs.to_string());
        }
        if let Some(location) = location {
            query.append_pair("location", &location.to_param());
        }
        Some(PendingRequest(query.finish()))
    }

    pub fn end_session(&self, at: RequestTime, duration_secs: u64) -> PendingRequest {
        let mut query = self.base(at);
        query.append_pair("end_session", "1");
        if duration_secs > 0 {
            query.append_pair("session_duration", &duration_secs.to_string());
        }
        PendingRequest(query.finish())
    }

    /// `batch` is the already URL-encoded JSON array produced by the event
    /// buffer, appended verbatim.
    pub fn record_events(&self, at: RequestTime, batch: &str) -> PendingRequest {
        let mut payload = self.base(at).finish();
        payload.push_str("&events=");
        payload.push_str(batch);
        PendingRequest(payload)
    }

    pub fn user_details(
        &self,
        at: RequestTime,
        profile: &UserProfile,
    ) -> PulseResult<Option<PendingRequest>> {
        if profile.is_empty() {
            return Ok(None);
        }
        let mut query = self.base(at);
        query.append_pair("user_details", &serde_json::to_string(profile)?);
        if let Some(path) = profile.picture_path.as_deref().filter(|p| !p.is_empty()) {
            query.append_pair(PICTURE_PATH_PARAM, path);
        }
        Ok(Some(PendingRequest(query.finish())))
    }

    pub fn crash_report(&self, at: RequestTime, report: &CrashReport) -> PulseResult<PendingRequest> {
        let mut query = self.base(at);
        query.append_pair(CRASH_PARAM, &serde_json::to_string(report)?);
        Ok(PendingRequest(query.finish()))
    }

    pub fn referrer(&self, at: RequestTime, referrer: &InstallReferrer) -> PendingRequest {
        let mut query = self.base(at);
        if let Some(campaign) = referrer.campaign_id.as_deref() {
            query.append_pair("campaign_id", campaign);
        }
        if let Some(user) = referrer.campaign_user.as_deref() {
            query.append_pair("campaign_user", user);
        }
        PendingRequest(query.finish())
    }

    pub fn token_session(
        &self,
        at: RequestTime,
        token: &str,
        mode: MessagingMode,
        locale: &str,
    ) -> PendingRequest {
        let mut query = self.base(at);
        query
            .append_pair("token_session", "1")
            .append_pair("android_token", token)
            .append_pair("test_mode", mode.test_mode_flag())
            .append_pair("locale", locale);
        PendingRequest(query.finish())
    }
}
