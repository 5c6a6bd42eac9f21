//! Device identity and device metrics.
//!
//! The identity is resolved according to a [`DeviceIdStrategy`]. Advertising
//! and anonymous ids come from external sources; when the advertising id is
//! unavailable the resolver falls back to the anonymous id and persists that
//! override, which then wins over whatever strategy later runs request.

use parking_lot::RwLock;
use pulse_core::types::DEFAULT_APP_VERSION;
use pulse_core::{PulseError, PulseResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{keys, KeyValueStore};

/// How the device id is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIdStrategy {
    DeveloperSupplied(String),
    AdvertisingId,
    AnonymousUdid,
}

impl DeviceIdStrategy {
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::DeveloperSupplied(_) => StrategyKind::DeveloperSupplied,
            Self::AdvertisingId => StrategyKind::AdvertisingId,
            Self::AnonymousUdid => StrategyKind::AnonymousUdid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    DeveloperSupplied,
    AdvertisingId,
    AnonymousUdid,
}

const CODEC_VERSION: &str = "v1";

impl StrategyKind {
    fn name(self) -> &'static str {
        match self {
            Self::DeveloperSupplied => "developer_supplied",
            Self::AdvertisingId => "advertising_id",
            Self::AnonymousUdid => "anonymous_udid",
        }
    }

    /// Persisted form, `v1:<kind>`.
    pub fn encode(self) -> String {
        format!("{CODEC_VERSION}:{}", self.name())
    }

    /// Reads the versioned form as well as the legacy unversioned names.
    /// Unknown values decode to `None` and are ignored.
    pub fn decode(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(name) = raw.strip_prefix("v1:") {
            return [
                Self::DeveloperSupplied,
                Self::AdvertisingId,
                Self::AnonymousUdid,
            ]
            .into_iter()
            .find(|kind| kind.name() == name);
        }
        match raw {
            "DEVELOPER_SUPPLIED" => Some(Self::DeveloperSupplied),
            "ADVERTISING_ID" => Some(Self::AdvertisingId),
            "OPEN_UDID" => Some(Self::AnonymousUdid),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("device id source unavailable: {0}")]
pub struct IdentityUnavailable(pub String);

/// Platform advertising id. `fetch` may block; it always runs off the
/// caller's thread.
pub trait AdvertisingIdSource: Send + Sync {
    fn is_available(&self) -> bool;
    fn fetch(&self) -> Result<String, IdentityUnavailable>;
}

/// Anonymous per-install id.
pub trait AnonymousIdSource: Send + Sync {
    fn anonymous_id(&self) -> Result<String, IdentityUnavailable>;
}

/// Anonymous id generated once as a random UUID and kept in the store.
pub struct StoredUuidSource {
    store: Arc<dyn KeyValueStore>,
}

impl StoredUuidSource {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }
}

impl AnonymousIdSource for StoredUuidSource {
    fn anonymous_id(&self) -> Result<String, IdentityUnavailable> {
        let unavailable = |e: PulseError| IdentityUnavailable(e.to_string());
        if let Some(id) = self.store.get(keys::ANONYMOUS_ID).map_err(unavailable)? {
            if !id.is_empty() {
                return Ok(id);
            }
        }
        let id = Uuid::new_v4().to_string();
        self.store
            .put(keys::ANONYMOUS_ID, &id)
            .map_err(unavailable)?;
        Ok(id)
    }
}

#[derive(Debug, Clone)]
struct IdentityState {
    kind: StrategyKind,
    overridden: bool,
    // Bumped by every resolution attempt; results of older attempts are ignored.
    generation: u64,
}

/// The identity requests are attributed to. The id stays `None` until
/// resolution completes.
pub struct DeviceIdentity {
    state: RwLock<IdentityState>,
    id: watch::Sender<Option<String>>,
}

impl DeviceIdentity {
    pub fn unresolved(kind: StrategyKind) -> Self {
        Self {
            state: RwLock::new(IdentityState {
                kind,
                overridden: false,
                generation: 0,
            }),
            id: watch::Sender::new(None),
        }
    }

    pub fn resolved(kind: StrategyKind, id: impl Into<String>) -> Self {
        let identity = Self::unresolved(kind);
        identity.id.send_replace(Some(id.into()));
        identity
    }

    pub fn id(&self) -> Option<String> {
        self.id.borrow().clone()
    }

    pub fn kind(&self) -> StrategyKind {
        self.state.read().kind
    }

    pub fn is_overridden(&self) -> bool {
        self.state.read().overridden
    }

    /// Waits until an id is available.
    pub async fn wait_resolved(&self) -> String {
        let mut rx = self.id.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(id) = current {
                return id;
            }
            // The sender lives in `self`, so it cannot be dropped here.
            let _ = rx.changed().await;
        }
    }

    /// Starts a new resolution attempt and returns its generation. `persist`
    /// runs under the state lock, so an older attempt can neither interleave
    /// its own writes nor complete afterwards. With `expected` set, nothing
    /// happens unless that attempt is still the current one.
    fn begin(
        &self,
        expected: Option<u64>,
        kind: StrategyKind,
        overridden: bool,
        persist: impl FnOnce() -> PulseResult<()>,
    ) -> PulseResult<Option<u64>> {
        let mut state = self.state.write();
        if expected.is_some_and(|generation| generation != state.generation) {
            return Ok(None);
        }
        persist()?;
        state.generation += 1;
        state.kind = kind;
        state.overridden = overridden;
        self.id.send_replace(None);
        Ok(Some(state.generation))
    }

    /// Publishes `id` unless a newer attempt has started since `generation`.
    fn complete(&self, generation: u64, kind: StrategyKind, id: String) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            debug!(strategy = %kind, "discarding device id from a superseded resolution");
            return false;
        }
        info!(device_id = %id, strategy = %kind, "device id resolved");
        state.kind = kind;
        self.id.send_replace(Some(id));
        true
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("kind", &self.kind())
            .field("overridden", &self.is_overridden())
            .field("id", &self.id())
            .finish()
    }
}

type ResolvedHook = Arc<dyn Fn() + Send + Sync>;

/// Resolves a [`DeviceIdentity`] and owns the persisted override.
#[derive(Clone)]
pub struct DeviceIdResolver {
    store: Arc<dyn KeyValueStore>,
    advertising: Option<Arc<dyn AdvertisingIdSource>>,
    anonymous: Arc<dyn AnonymousIdSource>,
    runtime: Handle,
    on_resolved: ResolvedHook,
}

impl DeviceIdResolver {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        advertising: Option<Arc<dyn AdvertisingIdSource>>,
        anonymous: Arc<dyn AnonymousIdSource>,
        runtime: Handle,
    ) -> Self {
        Self {
            store,
            advertising,
            anonymous,
            runtime,
            on_resolved: Arc::new(|| {}),
        }
    }

    /// Called every time an id becomes available.
    pub fn on_resolved(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_resolved = Arc::new(hook);
        self
    }

    pub fn persisted_override(&self) -> PulseResult<Option<StrategyKind>> {
        Ok(self
            .store
            .get(keys::IDENTITY_OVERRIDE)?
            .and_then(|raw| StrategyKind::decode(&raw)))
    }

    fn persist_override(&self, kind: StrategyKind) -> PulseResult<()> {
        self.store.put(keys::IDENTITY_OVERRIDE, &kind.encode())
    }

    /// Starts resolution for `requested`, honouring a persisted override.
    pub fn initialize(
        &self,
        requested: DeviceIdStrategy,
        identity: &Arc<DeviceIdentity>,
    ) -> PulseResult<()> {
        let (effective, overridden) = match self.persisted_override()? {
            Some(StrategyKind::AdvertisingId) if requested.kind() != StrategyKind::AdvertisingId => {
                info!(requested = %requested.kind(), "persisted device id strategy overrides requested one");
                (DeviceIdStrategy::AdvertisingId, true)
            }
            Some(StrategyKind::AnonymousUdid) if requested.kind() != StrategyKind::AnonymousUdid => {
                info!(requested = %requested.kind(), "persisted device id strategy overrides requested one");
                (DeviceIdStrategy::AnonymousUdid, true)
            }
            persisted => (requested, persisted.is_some()),
        };
        if let Some(generation) = identity.begin(None, effective.kind(), overridden, || Ok(()))? {
            self.resolve(effective, identity, generation);
        }
        Ok(())
    }

    /// Switches strategy at runtime. Non-developer strategies become the
    /// persisted override; a developer-supplied id clears it.
    pub fn switch_to(
        &self,
        strategy: DeviceIdStrategy,
        identity: &Arc<DeviceIdentity>,
    ) -> PulseResult<()> {
        warn!(from = %identity.kind(), to = %strategy.kind(), "switching device id strategy");
        let kind = strategy.kind();
        let started = match kind {
            StrategyKind::DeveloperSupplied => identity.begin(None, kind, false, || {
                self.store.remove(keys::IDENTITY_OVERRIDE)
            })?,
            _ => identity.begin(None, kind, true, || self.persist_override(kind))?,
        };
        if let Some(generation) = started {
            self.resolve(strategy, identity, generation);
        }
        Ok(())
    }

    fn resolve(&self, strategy: DeviceIdStrategy, identity: &Arc<DeviceIdentity>, generation: u64) {
        match strategy {
            DeviceIdStrategy::DeveloperSupplied(id) => {
                if identity.complete(generation, StrategyKind::DeveloperSupplied, id) {
                    (self.on_resolved)();
                }
            }
            DeviceIdStrategy::AdvertisingId => {
                let source = self
                    .advertising
                    .as_ref()
                    .filter(|source| source.is_available())
                    .cloned();
                let resolver = self.clone();
                let identity = identity.clone();
                self.runtime.spawn_blocking(move || match source {
                    Some(source) => match source.fetch() {
                        Ok(id) => {
                            if identity.complete(generation, StrategyKind::AdvertisingId, id) {
                                (resolver.on_resolved)();
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "advertising id unavailable, falling back to anonymous id");
                            resolver.fall_back(&identity, generation);
                        }
                    },
                    None => {
                        info!("advertising id source not available, falling back to anonymous id");
                        resolver.fall_back(&identity, generation);
                    }
                });
            }
            DeviceIdStrategy::AnonymousUdid => {
                let resolver = self.clone();
                let identity = identity.clone();
                self.runtime
                    .spawn_blocking(move || resolver.resolve_anonymous(&identity, generation));
            }
        }
    }

    fn fall_back(&self, identity: &Arc<DeviceIdentity>, generation: u64) {
        let started = identity.begin(Some(generation), StrategyKind::AnonymousUdid, true, || {
            if let Err(e) = self.persist_override(StrategyKind::AnonymousUdid) {
                warn!(error = %e, "failed to persist device id override");
            }
            Ok(())
        });
        match started {
            Ok(Some(next)) => self.resolve_anonymous(identity, next),
            Ok(None) => debug!("device id strategy changed during resolution, fallback skipped"),
            Err(e) => warn!(error = %e, "device id fallback failed"),
        }
    }

    fn resolve_anonymous(&self, identity: &Arc<DeviceIdentity>, generation: u64) {
        match self.anonymous.anonymous_id() {
            Ok(id) => {
                if identity.complete(generation, StrategyKind::AnonymousUdid, id) {
                    (self.on_resolved)();
                }
            }
            // Requests keep waiting in the queue; nothing else can be done.
            Err(e) => warn!(error = %e, "anonymous device id unavailable"),
        }
    }
}

/// Device description sent with `begin_session` and crash reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceMetrics {
    #[serde(rename = "_os", skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(rename = "_os_version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "_device", skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(rename = "_resolution", skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(rename = "_carrier", skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(rename = "_app_version", skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(rename = "_locale", skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

impl DeviceMetrics {
    /// Metrics describing the current process's host.
    pub fn host() -> Self {
        Self {
            os: Some(std::env::consts::OS.to_string()),
            device: Some(std::env::consts::ARCH.to_string()),
            app_version: Some(DEFAULT_APP_VERSION.to_string()),
            locale: std::env::var("LANG")
                .ok()
                .and_then(|lang| lang.split('.').next().map(str::to_string))
                .filter(|lang| !lang.is_empty()),
            ..Default::default()
        }
    }

    pub fn locale_or_default(&self) -> &str {
        self.locale.as_deref().unwrap_or("en_US")
    }
}
