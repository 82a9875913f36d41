//! # CacheKit Service Worker
//!
//! An offline pre-cache worker: a fixed asset manifest is fetched and stored
//! in a named cache when the worker installs, and intercepted requests are
//! answered cache-first afterwards, falling back to the network on a miss.
//!
//! ## Architecture
//!
//! ```text
//! WorkerHost
//!     │
//!     └── Registration (per scope)
//!             ├── installing (RegisteredWorker)
//!             ├── waiting    (RegisteredWorker)
//!             └── active     (RegisteredWorker ── PrecacheWorker)
//!                                                     │ install event → populate
//!                                                     │ fetch event   → cache-first
//! CacheStorage
//!     └── Cache (named)
//!             └── CacheKey (URL + method) → CacheEntry
//! ```
//!
//! The cache name and the asset manifest are configuration handed to the
//! worker at construction ([`WorkerConfig`]), not free constants, so rotating
//! the cache name never touches handler logic. Install population is
//! all-or-nothing: responses are staged and committed only after every
//! manifest fetch succeeds. The fetch handler never writes to the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use cachekit_common::{CacheKitError, OptionExt, Result};
use cachekit_net::{Fetcher, Request, Response};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use url::Url;

// ==================== Configuration ====================

/// Configuration handed to a worker at construction.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of the cache this worker populates and serves from. Must stay
    /// stable across deployments that intend to reuse the store; changing it
    /// orphans the old cache (no automatic cleanup).
    pub cache_name: String,

    /// Ordered list of same-origin paths to pre-cache at install time.
    /// Duplicates are permitted (harmless, wasteful).
    pub precache_manifest: Vec<String>,
}

impl WorkerConfig {
    /// Create a worker configuration.
    pub fn new<S, I, P>(cache_name: S, manifest: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Self {
            cache_name: cache_name.into(),
            precache_manifest: manifest.into_iter().map(Into::into).collect(),
        }
    }
}

// ==================== Cache ====================

/// Key a cached response is stored under: exact URL plus method, no
/// header or query normalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Derive the key for a request.
    pub fn of(request: &Request) -> Self {
        Self {
            method: request.method.to_string(),
            url: request.url.to_string(),
        }
    }
}

/// A stored response snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a network response for the given request.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }
}

/// A named cache of request → response snapshots.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Stored entries.
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new, empty cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Look up a stored entry by exact key.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Store an entry, overwriting any previous one under the same key.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Delete an entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// All stored keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The collection of named caches, shared across worker activations.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache, creating it if absent. Idempotent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if a cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All cache names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }
}

// ==================== Events ====================

/// The install lifecycle event. The handler's returned future is the
/// completion the host awaits before finishing the install step.
#[derive(Debug, Clone)]
pub struct InstallEvent {
    /// Registration scope; manifest paths are resolved against it.
    pub scope: Url,
}

/// An intercepted request. The handler's returned response is substituted
/// for the network response the page would otherwise have seen.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Originating client, when known.
    pub client_id: Option<String>,
}

/// The response handed back to an intercepted request's consumer.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    /// Status code.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Whether this was answered from the cache.
    pub from_cache: bool,
}

impl ServedResponse {
    /// Serve a stored snapshot.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            from_cache: true,
        }
    }

    /// Pass a network response through unmodified, error statuses included.
    pub fn from_network(response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            from_cache: false,
        }
    }
}

// ==================== Worker ====================

/// The offline pre-cache worker: an install handler that populates the named
/// cache from the manifest, and a fetch handler that answers cache-first.
pub struct PrecacheWorker {
    config: WorkerConfig,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
}

impl PrecacheWorker {
    /// Create a worker over shared cache storage and a network fetcher.
    pub fn new(
        config: WorkerConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    /// Name of the cache this worker serves from.
    pub fn cache_name(&self) -> &str {
        &self.config.cache_name
    }

    /// Handle the install event: open the named cache and populate it with
    /// every manifest asset.
    ///
    /// The populate is a single awaited unit. Any asset failing (a
    /// non-success status or a transport error) fails the whole install,
    /// and nothing is committed to the cache. Re-running install re-fetches
    /// and overwrites every entry; there is no dedup short-circuit.
    pub async fn handle_install(&self, event: InstallEvent) -> Result<()> {
        // Open first so the store exists even if population fails.
        self.caches.write().await.open(&self.config.cache_name);

        let mut staged = Vec::with_capacity(self.config.precache_manifest.len());
        for path in &self.config.precache_manifest {
            let url = event.scope.join(path).map_err(|e| {
                CacheKitError::config(format!("invalid manifest path {path}: {e}"))
            })?;
            let request = Request::get(url);
            let key = CacheKey::of(&request);

            let response = self.fetcher.fetch(request.clone()).await?;
            if !response.ok() {
                return Err(CacheKitError::cache(format!(
                    "pre-cache fetch for {path} returned {}",
                    response.status
                )));
            }

            debug!(path = %path, status = %response.status, "Staged pre-cache asset");
            staged.push((key, CacheEntry::from_response(&request, &response)));
        }

        // Every fetch succeeded; commit the batch.
        let count = staged.len();
        let mut caches = self.caches.write().await;
        let cache = caches.open(&self.config.cache_name);
        for (key, entry) in staged {
            cache.put(key, entry);
        }

        info!(
            cache = %self.config.cache_name,
            assets = count,
            "Pre-cache population complete"
        );
        Ok(())
    }

    /// Handle an intercepted request: answer from the named cache when an
    /// exact URL + method match exists, otherwise forward to the network
    /// exactly once and pass the result through unmodified.
    ///
    /// A network failure on a cache miss propagates to the caller; no
    /// offline fallback is substituted. This handler never writes to the
    /// cache.
    pub async fn handle_fetch(&self, event: FetchEvent) -> Result<ServedResponse> {
        let key = CacheKey::of(&event.request);

        {
            let caches = self.caches.read().await;
            if let Some(entry) = caches
                .get(&self.config.cache_name)
                .and_then(|cache| cache.match_request(&key))
            {
                debug!(
                    url = %event.request.url,
                    client = ?event.client_id,
                    "Serving from cache"
                );
                return Ok(ServedResponse::from_entry(entry));
            }
        }

        debug!(url = %event.request.url, "Cache miss, forwarding to network");
        let response = self.fetcher.fetch(event.request).await?;
        Ok(ServedResponse::from_network(&response))
    }
}

// ==================== Lifecycle ====================

/// Unique identifier for a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl WorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Created, install not yet dispatched.
    Parsed,
    /// Install event in flight.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activation in progress.
    Activating,
    /// Active and controlling requests.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::Parsed
    }
}

/// A worker occupying a registration slot.
pub struct RegisteredWorker {
    /// Unique ID.
    pub id: WorkerId,

    /// Current lifecycle state.
    pub state: WorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    worker: Arc<PrecacheWorker>,
}

impl RegisteredWorker {
    /// Wrap a worker for registration.
    pub fn new(worker: Arc<PrecacheWorker>) -> Self {
        Self {
            id: WorkerId::new(),
            state: WorkerState::Parsed,
            state_changed_at: Instant::now(),
            worker,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == WorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == WorkerState::Redundant
    }

    /// The underlying worker.
    pub fn worker(&self) -> &Arc<PrecacheWorker> {
        &self.worker
    }
}

/// A worker registration for one scope.
pub struct Registration {
    /// Scope URL.
    pub scope: Url,

    /// Worker whose install event is in flight.
    pub installing: Option<RegisteredWorker>,

    /// Installed worker awaiting activation.
    pub waiting: Option<RegisteredWorker>,

    /// Active worker.
    pub active: Option<RegisteredWorker>,
}

impl Registration {
    /// Create an empty registration for a scope.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&RegisteredWorker> {
        self.active.as_ref()
    }

    /// Transition installing to waiting after a successful install.
    pub fn install_complete(&mut self) {
        if let Some(mut worker) = self.installing.take() {
            worker.set_state(WorkerState::Installed);
            self.waiting = Some(worker);
        }
    }

    /// Discard the installing worker after a failed install. Any previously
    /// active worker stays in control.
    pub fn install_failed(&mut self) -> Option<WorkerId> {
        self.installing.take().map(|mut worker| {
            worker.set_state(WorkerState::Redundant);
            worker.id
        })
    }

    /// Activate the waiting worker, replacing (and retiring) the old active
    /// one.
    pub fn activate(&mut self) {
        if let Some(mut worker) = self.waiting.take() {
            worker.set_state(WorkerState::Activating);

            if let Some(mut old) = self.active.take() {
                old.set_state(WorkerState::Redundant);
            }

            worker.set_state(WorkerState::Activated);
            self.active = Some(worker);
        }
    }

    /// Retire every worker in the registration.
    pub fn unregister(&mut self) {
        for slot in [
            self.active.take(),
            self.waiting.take(),
            self.installing.take(),
        ] {
            if let Some(mut worker) = slot {
                worker.set_state(WorkerState::Redundant);
            }
        }
    }
}

// ==================== Host ====================

/// Lifecycle events emitted by the host.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// A new worker started installing for a scope.
    UpdateFound { scope: String },
    /// A worker changed state.
    StateChange {
        scope: String,
        worker_id: WorkerId,
        new_state: WorkerState,
    },
    /// A worker's install event failed; the previous version (if any)
    /// remains in control.
    InstallFailed { scope: String, worker_id: WorkerId },
}

/// The host side of the worker contract: registers workers, drives their
/// install event, activates them, and routes intercepted requests to the
/// active worker for a scope.
pub struct WorkerHost {
    registrations: Arc<RwLock<HashMap<String, Registration>>>,
    caches: Arc<RwLock<CacheStorage>>,
    event_tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl WorkerHost {
    /// Create a host and the receiving end of its lifecycle event stream.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches: Arc::new(RwLock::new(CacheStorage::new())),
                event_tx,
            },
            event_rx,
        )
    }

    /// The cache storage shared by every worker this host registers.
    pub fn caches(&self) -> Arc<RwLock<CacheStorage>> {
        Arc::clone(&self.caches)
    }

    /// Register a worker for a scope and drive its install event.
    ///
    /// On success the worker lands in the registration's waiting slot;
    /// [`activate`](Self::activate) promotes it. On install failure the new
    /// worker is discarded, any previously active worker keeps controlling
    /// the scope, and the error is returned for the caller's retry policy.
    pub async fn register(
        &self,
        scope: &str,
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<()> {
        let scope_url = Url::parse(scope)
            .map_err(|e| CacheKitError::config(format!("invalid scope {scope}: {e}")))?;
        let scope_key = scope_url.to_string();

        let worker = Arc::new(PrecacheWorker::new(
            config,
            Arc::clone(&self.caches),
            fetcher,
        ));

        {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(scope_key.clone())
                .or_insert_with(|| Registration::new(scope_url.clone()));

            let mut slot = RegisteredWorker::new(Arc::clone(&worker));
            slot.set_state(WorkerState::Installing);
            registration.installing = Some(slot);
        }

        let _ = self.event_tx.send(LifecycleEvent::UpdateFound {
            scope: scope_key.clone(),
        });

        // The registration lock is not held across the install so fetch
        // handlers for other requests can interleave.
        let installed = worker.handle_install(InstallEvent { scope: scope_url }).await;

        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(&scope_key)
            .ok_or_not_found(scope_key.clone())?;

        match installed {
            Ok(()) => {
                registration.install_complete();
                if let Some(ref waiting) = registration.waiting {
                    let _ = self.event_tx.send(LifecycleEvent::StateChange {
                        scope: scope_key,
                        worker_id: waiting.id,
                        new_state: WorkerState::Installed,
                    });
                }
                Ok(())
            }
            Err(err) => {
                if let Some(worker_id) = registration.install_failed() {
                    let _ = self.event_tx.send(LifecycleEvent::InstallFailed {
                        scope: scope_key.clone(),
                        worker_id,
                    });
                }
                warn!(
                    scope = %scope_key,
                    error = %err,
                    "Worker install failed; previous version retained"
                );
                Err(err)
            }
        }
    }

    /// Activate the waiting worker for a scope.
    pub async fn activate(&self, scope: &str) -> Result<()> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations.get_mut(scope).ok_or_not_found(scope)?;

        if registration.waiting.is_none() {
            return Err(CacheKitError::lifecycle(format!(
                "no installed worker waiting for {scope}"
            )));
        }

        registration.activate();

        if let Some(active) = registration.get_active() {
            info!(scope, "Worker activated");
            let _ = self.event_tx.send(LifecycleEvent::StateChange {
                scope: scope.to_string(),
                worker_id: active.id,
                new_state: WorkerState::Activated,
            });
        }

        Ok(())
    }

    /// Route an intercepted request to the active worker whose scope covers
    /// it (longest matching scope wins).
    pub async fn handle_fetch(&self, event: FetchEvent) -> Result<ServedResponse> {
        let worker = {
            let registrations = self.registrations.read().await;
            let url = event.request.url.as_str();

            let mut best: Option<&Registration> = None;
            for registration in registrations.values() {
                if !url.starts_with(registration.scope.as_str()) {
                    continue;
                }
                let longer = best
                    .map(|b| registration.scope.as_str().len() > b.scope.as_str().len())
                    .unwrap_or(true);
                if longer {
                    best = Some(registration);
                }
            }

            best.and_then(|registration| registration.get_active())
                .map(|active| Arc::clone(active.worker()))
        };

        let worker = worker.ok_or_else(|| {
            CacheKitError::lifecycle(format!(
                "no active worker controls {}",
                event.request.url
            ))
        })?;

        worker.handle_fetch(event).await
    }

    /// Find the registration scope covering a URL.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let registrations = self.registrations.read().await;
        registrations
            .keys()
            .filter(|scope| url.starts_with(scope.as_str()))
            .max_by_key(|scope| scope.len())
            .cloned()
    }

    /// All registered scopes.
    pub async fn get_registrations(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }

    /// Remove a registration, retiring its workers. Cached entries are left
    /// behind; clearing the store is external to this artifact.
    pub async fn unregister(&self, scope: &str) -> Result<bool> {
        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope) {
            Some(mut registration) => {
                registration.unregister();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for WorkerHost {
    fn default() -> Self {
        Self::new().0
    }
}
