//! The `Pulse` context object: owns every component, serializes all public
//! mutations behind one lock and triggers delivery after each of them.

use parking_lot::Mutex;
use pulse_core::{PulseConfig, PulseError, PulseResult, RequestTime};
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::crash::{CrashContext, CrashReport};
use crate::delivery::{DeliveryScheduler, DeliveryState, DeliveryWorker, Transport};
use crate::device::{
    AdvertisingIdSource, AnonymousIdSource, DeviceIdResolver, DeviceIdStrategy, DeviceIdentity,
    DeviceMetrics, StoredUuidSource, StrategyKind,
};
use crate::events::{EventBuffer, Segmentation};
use crate::messaging::{MessagingCapability, MessagingMode};
use crate::queue::PendingQueue;
use crate::referrer::InstallReferrer;
use crate::requests::{Location, PendingRequest, RequestBuilder};
use crate::sessions::{SessionPhase, SessionTracker, StopOutcome, ViewTracker, VIEW_EVENT_KEY};
use crate::store::{keys, KeyValueStore};
use crate::user::UserProfile;

/// Assembles a [`Pulse`] context.
pub struct PulseBuilder {
    config: PulseConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    strategy: Option<DeviceIdStrategy>,
    advertising: Option<Arc<dyn AdvertisingIdSource>>,
    anonymous: Option<Arc<dyn AnonymousIdSource>>,
    messaging: Option<Arc<dyn MessagingCapability>>,
    metrics: Option<DeviceMetrics>,
}

impl PulseBuilder {
    fn new(config: PulseConfig) -> Self {
        Self {
            config,
            store: None,
            strategy: None,
            advertising: None,
            anonymous: None,
            messaging: None,
            metrics: None,
        }
    }

    /// Required. Everything the SDK must not lose is persisted here.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to the configured `device_id` if any, else an anonymous id.
    pub fn device_id_strategy(mut self, strategy: DeviceIdStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn advertising_id_source(mut self, source: Arc<dyn AdvertisingIdSource>) -> Self {
        self.advertising = Some(source);
        self
    }

    /// Defaults to a random UUID persisted in the store.
    pub fn anonymous_id_source(mut self, source: Arc<dyn AnonymousIdSource>) -> Self {
        self.anonymous = Some(source);
        self
    }

    pub fn messaging(mut self, capability: Arc<dyn MessagingCapability>) -> Self {
        self.messaging = Some(capability);
        self
    }

    pub fn device_metrics(mut self, metrics: DeviceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Must be called inside a tokio runtime; delivery, identity resolution
    /// and the heartbeat run on it.
    pub fn build(self) -> PulseResult<Arc<Pulse>> {
        self.config.validate()?;
        let store = self
            .store
            .ok_or_else(|| PulseError::config("a key-value store is required"))?;
        let runtime = Handle::try_current()
            .map_err(|_| PulseError::config("Pulse must be built inside a tokio runtime"))?;

        let strategy = match self.strategy {
            Some(DeviceIdStrategy::DeveloperSupplied(id)) if id.is_empty() => {
                return Err(PulseError::config("developer-supplied device id is empty"));
            }
            Some(strategy) => strategy,
            None => match &self.config.device_id {
                Some(id) => DeviceIdStrategy::DeveloperSupplied(id.clone()),
                None => DeviceIdStrategy::AnonymousUdid,
            },
        };

        let queue = Arc::new(PendingQueue::new(store.clone()));
        let identity = Arc::new(DeviceIdentity::unresolved(strategy.kind()));
        let transport = Transport::new(&self.config)?;
        let scheduler = DeliveryScheduler::new(
            DeliveryWorker::new(queue.clone(), identity.clone(), transport),
            runtime.clone(),
        );

        let anonymous = self
            .anonymous
            .unwrap_or_else(|| Arc::new(StoredUuidSource::new(store.clone())));
        let on_resolved = Arc::downgrade(&scheduler);
        let resolver = DeviceIdResolver::new(store.clone(), self.advertising, anonymous, runtime.clone())
            .on_resolved(move || {
                if let Some(scheduler) = on_resolved.upgrade() {
                    scheduler.tick();
                }
            });
        resolver.initialize(strategy, &identity)?;

        if let Some(messaging) = &self.messaging {
            messaging.store_configuration(
                &self.config.server_url,
                &self.config.app_key,
                identity.id().as_deref(),
            );
        }

        let first_view_pending = store.get(keys::FIRST_VIEW_RECORDED)?.is_none();
        let state = CoreState {
            session: SessionTracker::new(),
            views: ViewTracker::new(self.config.view_segment.clone(), first_view_pending),
            crash: CrashContext::new(),
            location: None,
            auto_view_tracking: self.config.auto_view_tracking,
            messaging_mode: None,
        };

        let pulse = Arc::new(Pulse {
            requests: RequestBuilder::new(self.config.app_key.clone()),
            events: EventBuffer::new(store.clone()),
            metrics: self.metrics.unwrap_or_else(DeviceMetrics::host),
            messaging: self.messaging,
            config: self.config,
            store,
            queue,
            identity,
            resolver,
            scheduler,
            runtime,
            state: Mutex::new(state),
            heartbeat: Mutex::new(None),
        });
        pulse.start_heartbeat();
        // Requests persisted by an earlier process.
        pulse.scheduler.tick();

        info!(
            server_url = %pulse.config.server_url,
            strategy = %pulse.identity.kind(),
            "pulse initialized"
        );
        Ok(pulse)
    }
}

struct CoreState {
    session: SessionTracker,
    views: ViewTracker,
    crash: CrashContext,
    location: Option<Location>,
    auto_view_tracking: bool,
    messaging_mode: Option<MessagingMode>,
}

/// One SDK instance. Hosts build it once per process and pass it to their
/// lifecycle hooks.
pub struct Pulse {
    config: PulseConfig,
    requests: RequestBuilder,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<PendingQueue>,
    events: EventBuffer,
    identity: Arc<DeviceIdentity>,
    resolver: DeviceIdResolver,
    scheduler: Arc<DeliveryScheduler>,
    messaging: Option<Arc<dyn MessagingCapability>>,
    metrics: DeviceMetrics,
    runtime: Handle,
    state: Mutex<CoreState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Pulse {
    pub fn builder(config: PulseConfig) -> PulseBuilder {
        PulseBuilder::new(config)
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();
        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pulse) = weak.upgrade() else {
                    break;
                };
                // Enqueueing writes through to the store.
                match tokio::task::spawn_blocking(move || pulse.heartbeat()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "heartbeat failed"),
                    Err(e) => warn!(error = %e, "heartbeat task failed"),
                }
            }
        });
        *self.heartbeat.lock() = Some(handle);
    }

    fn enqueue(&self, request: PendingRequest) -> PulseResult<()> {
        self.queue.enqueue(request)
    }

    /// Events leave the buffer only once their batch is queued.
    fn flush_events_locked(&self, at: RequestTime) -> PulseResult<()> {
        if self.events.size()? == 0 {
            return Ok(());
        }
        let batch = self.events.batch()?;
        self.enqueue(self.requests.record_events(at, &batch))?;
        self.events.clear()
    }

    fn flush_events_if_needed(&self, at: RequestTime) -> PulseResult<()> {
        if self.events.size()? >= self.config.event_flush_threshold {
            self.flush_events_locked(at)?;
        }
        Ok(())
    }

    /// Host hook: an activity came to the foreground. `view` is recorded as a
    /// view when automatic view tracking is on.
    pub fn on_start(&self, view: Option<&str>) -> PulseResult<()> {
        let at = RequestTime::now();
        let mut state = self.state.lock();
        // Tracker state only advances once the matching request is queued.
        let mut session = state.session.clone();
        if session.activity_started(Instant::now()) {
            self.enqueue(self.requests.begin_session(at, &self.metrics)?)?;
            info!("session started");
        }
        state.session = session;

        if let Some(referrer) = InstallReferrer::load(self.store.as_ref())? {
            self.enqueue(self.requests.referrer(at, &referrer))?;
            InstallReferrer::delete(self.store.as_ref())?;
        }

        if state.auto_view_tracking {
            if let Some(name) = view.filter(|name| !name.is_empty()) {
                self.record_view_locked(&mut state, name, at)?;
            }
        }
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    /// Host hook: an activity left the foreground.
    pub fn on_stop(&self) -> PulseResult<()> {
        let at = RequestTime::now();
        let mut state = self.state.lock();
        let mut session = state.session.clone();
        let outcome = session.activity_stopped(Instant::now())?;

        let mut views = state.views.clone();
        if let Some(closing) = views.close(at.timestamp) {
            self.events.record_at(at, VIEW_EVENT_KEY, closing, 1, None)?;
        }
        state.views = views;

        if let StopOutcome::Ended { duration_secs } = outcome {
            self.enqueue(self.requests.end_session(at, duration_secs))?;
            info!(duration_secs, "session ended");
        }
        state.session = session;
        if matches!(outcome, StopOutcome::Ended { .. }) {
            self.flush_events_locked(at)?;
        }
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    /// Periodic session update; a no-op while no activity is in the foreground.
    pub fn heartbeat(&self) -> PulseResult<()> {
        let at = RequestTime::now();
        let mut state = self.state.lock();
        if state.session.phase() == SessionPhase::Active {
            if !self.config.disable_update_session_requests {
                let mut session = state.session.clone();
                if let Some(duration) = session.heartbeat(Instant::now()) {
                    if let Some(request) = self.requests.update_session(at, duration, state.location) {
                        self.enqueue(request)?;
                    }
                }
                state.session = session;
                state.location = None;
            }
            self.flush_events_locked(at)?;
        }
        drop(state);
        // Also the retry trigger for a blocked queue.
        self.scheduler.tick();
        Ok(())
    }

    pub fn record_event(
        &self,
        key: &str,
        segmentation: Segmentation,
        count: u32,
        sum: Option<f64>,
    ) -> PulseResult<()> {
        let at = RequestTime::now();
        let state = self.state.lock();
        self.events.record_at(at, key, segmentation, count, sum)?;
        self.flush_events_if_needed(at)?;
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    pub fn record_view(&self, name: &str) -> PulseResult<()> {
        if name.is_empty() {
            return Err(PulseError::validation("view name cannot be empty"));
        }
        let at = RequestTime::now();
        let mut state = self.state.lock();
        self.record_view_locked(&mut state, name, at)?;
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    fn record_view_locked(&self, state: &mut CoreState, name: &str, at: RequestTime) -> PulseResult<()> {
        let mut views = state.views.clone();
        let was_first = views.is_first_view_pending();
        for segmentation in views.record_view(name, at.timestamp) {
            self.events.record_at(at, VIEW_EVENT_KEY, segmentation, 1, None)?;
        }
        if was_first {
            self.store.put(keys::FIRST_VIEW_RECORDED, "1")?;
        }
        state.views = views;
        debug!(view = name, "view recorded");
        self.flush_events_if_needed(at)
    }

    pub fn set_view_tracking(&self, enabled: bool) {
        self.state.lock().auto_view_tracking = enabled;
    }

    pub fn set_user_data(&self, profile: &UserProfile) -> PulseResult<()> {
        let state = self.state.lock();
        if let Some(request) = self.requests.user_details(RequestTime::now(), profile)? {
            self.enqueue(request)?;
        }
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    /// Attaches a location to the next session update.
    pub fn set_location(&self, latitude: f64, longitude: f64) -> PulseResult<()> {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(PulseError::validation(format!(
                "invalid location {latitude},{longitude}"
            )));
        }
        let location = Location {
            latitude,
            longitude,
        };
        let mut state = self.state.lock();
        if !self.config.disable_update_session_requests {
            state.location = Some(location);
            return Ok(());
        }
        let mut session = state.session.clone();
        let duration = session.take_elapsed(Instant::now());
        if let Some(request) = self
            .requests
            .update_session(RequestTime::now(), duration, Some(location))
        {
            self.enqueue(request)?;
        }
        state.session = session;
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    pub fn add_crash_log(&self, record: impl Into<String>) {
        self.state.lock().crash.add_log(record);
    }

    pub fn set_custom_crash_segments(&self, segments: BTreeMap<String, String>) {
        self.state.lock().crash.set_custom_segments(segments);
    }

    pub fn record_crash(&self, trace: &str, fatal: bool) -> PulseResult<()> {
        self.send_crash(CrashReport::new(trace, !fatal, &self.metrics))
    }

    /// Non-fatal crash report for a handled error.
    pub fn record_error(&self, error: &(dyn StdError + 'static)) -> PulseResult<()> {
        self.send_crash(CrashReport::from_error(error, &self.metrics))
    }

    fn send_crash(&self, report: CrashReport) -> PulseResult<()> {
        let mut state = self.state.lock();
        let background = state.session.phase() == SessionPhase::Inactive;
        let logs = state.crash.take_logs();
        let report = report
            .with_context(logs, state.crash.custom())
            .in_background(background);
        warn!(nonfatal = report.nonfatal, "recording crash report");
        self.enqueue(self.requests.crash_report(RequestTime::now(), &report)?)?;
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    /// Enables push tokens. Fails when no messaging capability was installed.
    pub fn init_messaging(&self, mode: MessagingMode) -> PulseResult<()> {
        if self.messaging.is_none() {
            return Err(PulseError::config("no messaging capability installed"));
        }
        self.state.lock().messaging_mode = Some(mode);
        info!(?mode, "messaging initialized");
        Ok(())
    }

    /// Called by the messaging capability with a fresh push token. The
    /// `token_session` request is delayed so that `begin_session` is
    /// processed first.
    pub fn on_registration_id(self: &Arc<Self>, token: impl Into<String>) -> PulseResult<()> {
        let Some(mode) = self.state.lock().messaging_mode else {
            return Err(PulseError::config("messaging is not initialized"));
        };
        let token = token.into();
        let weak = Arc::downgrade(self);
        let delay = self.config.token_session_delay();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(pulse) = weak.upgrade() else {
                return;
            };
            match tokio::task::spawn_blocking(move || pulse.send_token_session(&token, mode)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "failed to enqueue token session"),
                Err(e) => warn!(error = %e, "token session task failed"),
            }
        });
        Ok(())
    }

    fn send_token_session(&self, token: &str, mode: MessagingMode) -> PulseResult<()> {
        let state = self.state.lock();
        self.enqueue(self.requests.token_session(
            RequestTime::now(),
            token,
            mode,
            self.metrics.locale_or_default(),
        ))?;
        drop(state);
        self.scheduler.tick();
        Ok(())
    }

    /// Stores campaign attribution; it is sent on the next activity start.
    /// Returns `false` when the referrer carries no campaign.
    pub fn record_install_referrer(&self, raw: &str) -> PulseResult<bool> {
        let Some(referrer) = InstallReferrer::parse(raw) else {
            debug!("install referrer without campaign ignored");
            return Ok(false);
        };
        let _state = self.state.lock();
        referrer.persist(self.store.as_ref())?;
        Ok(true)
    }

    /// Re-resolves the device id under a new strategy. Queued requests are
    /// attributed to whichever id is current when they are sent.
    pub fn switch_device_id(&self, strategy: DeviceIdStrategy) -> PulseResult<()> {
        if matches!(&strategy, DeviceIdStrategy::DeveloperSupplied(id) if id.is_empty()) {
            return Err(PulseError::validation("developer-supplied device id is empty"));
        }
        let _state = self.state.lock();
        self.resolver.switch_to(strategy, &self.identity)
    }

    /// Discards all pending requests and buffered events and resets session,
    /// view and crash state.
    pub fn halt(&self) -> PulseResult<()> {
        let mut state = self.state.lock();
        self.queue.clear()?;
        self.events.clear()?;
        state.session.reset();
        state.views.reset();
        state.crash = CrashContext::new();
        state.location = None;
        drop(state);
        self.scheduler.reset();
        warn!("pulse halted, pending data discarded");
        Ok(())
    }

    /// Triggers delivery and resolves once no run is in flight.
    pub async fn flush(&self) -> DeliveryState {
        self.scheduler.tick();
        self.scheduler.settle().await
    }

    pub fn delivery_state(&self) -> DeliveryState {
        self.scheduler.state()
    }

    pub fn pending_requests(&self) -> PulseResult<usize> {
        self.queue.len()
    }

    pub fn pending_snapshot(&self) -> PulseResult<Vec<PendingRequest>> {
        self.queue.snapshot()
    }

    pub fn buffered_events(&self) -> PulseResult<usize> {
        self.events.size()
    }

    pub fn device_id(&self) -> Option<String> {
        self.identity.id()
    }

    pub fn device_id_kind(&self) -> StrategyKind {
        self.identity.kind()
    }

    /// Waits for identity resolution to complete.
    pub async fn resolved_device_id(&self) -> String {
        self.identity.wait_resolved().await
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.state.lock().session.phase()
    }
}

impl Drop for Pulse {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}
