//! # CacheKit Worker
//!
//! The offline cache worker: intercepts requests, serves cached responses,
//! and manages versioned cache stores across application updates.
//!
//! ## Features
//!
//! - **Versioned store naming**: one shell store per deployment, one
//!   long-lived asset store
//! - **Install**: concurrent pre-cache of the build manifest, skip-waiting
//! - **Activate**: claim clients, prune stale generations, broadcast the
//!   new version
//! - **Fetch policy**: cache-first, fall back to the network, write back
//!   qualifying responses
//! - **Lifecycle**: validated state machine with an observer event stream
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker
//!     │
//!     ├── StoreNames ("shell-<version>", "assets")
//!     │
//!     ├── StoreRegistry (cachekit-store)
//!     │       ├── Store "shell-<version>"
//!     │       └── Store "assets"
//!     │
//!     ├── FetchPolicy ──── FetchBackend (cachekit-net)
//!     │
//!     └── ClientRegistry
//!             └── Client ◄── ClientMessage::VersionUpdate
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use hashbrown::HashMap;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

use cachekit_net::{classify, ResponseClass};

pub use cachekit_common::{BuildVersion, Manifest, WorkerConfig};
pub use cachekit_net::{FetchBackend, FetchError, Request, Response};
pub use cachekit_store::{RequestKey, StoreEntry, StoreError, StoreRegistry};

// ==================== Errors ====================

/// Errors that can occur in worker lifecycle operations.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// A manifest URL could not be pre-cached; the instance is discarded.
    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("invalid lifecycle transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: WorkerState,
        to: WorkerState,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ==================== Store Naming ====================

/// Name of the version-independent asset store.
pub const ASSET_STORE_NAME: &str = "assets";

/// Prefix of the per-version shell store name.
pub const SHELL_STORE_PREFIX: &str = "shell-";

/// The two store names of one cache generation.
///
/// The shell name embeds the build version, so every deployment gets a
/// fresh shell store and staleness is handled by store replacement rather
/// than revalidation. The asset name never changes: entries cached there
/// are treated as immutable and survive upgrades.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNames {
    shell: String,
    assets: String,
}

impl StoreNames {
    /// Derive the generation's store names from a build version.
    pub fn for_version(version: &BuildVersion) -> Self {
        Self {
            shell: format!("{SHELL_STORE_PREFIX}{version}"),
            assets: ASSET_STORE_NAME.to_string(),
        }
    }

    /// The per-version shell store name.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// The version-independent asset store name.
    pub fn assets(&self) -> &str {
        &self.assets
    }

    /// Whether a store name belongs to this generation.
    pub fn contains(&self, name: &str) -> bool {
        name == self.shell || name == self.assets
    }
}

// ==================== Worker State ====================

/// Lifecycle state of a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, no event handled yet.
    #[default]
    Idle,
    /// Install event in progress.
    Installing,
    /// Pre-cache complete, eligible for activation.
    Installed,
    /// Activate event in progress.
    Activating,
    /// Controlling clients and serving fetches.
    Active,
    /// Discarded after a fatal install failure or replacement.
    Defunct,
}

impl WorkerState {
    /// Whether a transition to `to` is allowed from this state.
    pub fn can_transition_to(self, to: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, to),
            (Idle, Installing)
                | (Installing, Installed)
                | (Installing, Defunct)
                | (Installed, Activating)
                | (Activating, Active)
                | (Activating, Defunct)
                | (Active, Defunct)
        )
    }
}

// ==================== Lifecycle Events ====================

/// The worker's complete inbound protocol.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// Pre-cache the manifest and become eligible for activation.
    Install,
    /// Take control, prune stale stores, announce the version.
    Activate,
    /// Decide cache-or-network for one intercepted request.
    Fetch(Request),
}

/// Result of dispatching one lifecycle event.
#[derive(Debug)]
pub enum EventOutcome {
    Installed,
    Activated,
    Fetch(FetchOutcome),
}

// ==================== Worker Events ====================

/// Observer notifications published by the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// The lifecycle state changed.
    StateChanged {
        from: WorkerState,
        to: WorkerState,
    },
    /// Install finished; the instance does not wait behind older ones.
    SkipWaitingRequested,
    /// Activation finished and clients were notified.
    VersionActivated { version: BuildVersion },
}

// ==================== Clients ====================

/// Unique identifier for a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kind of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// A page; receives version broadcasts.
    Page,
    /// A non-page context; never notified.
    Worker,
}

/// Message sent to connected clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientMessage {
    /// A new version finished activating.
    #[serde(rename = "VERSION_UPDATE")]
    VersionUpdate { version: String },
}

/// A live connected page or worker context.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub kind: ClientKind,
    /// Whether this worker instance controls the client.
    pub controlled: bool,
    sender: mpsc::UnboundedSender<ClientMessage>,
}

/// The set of currently connected clients.
///
/// Clients are transient: enumerated on demand, dropped on disconnect,
/// never persisted.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<ClientId, Client>>>,
}

impl ClientRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client; returns its id and the receiving end of its
    /// message channel.
    pub async fn connect(
        &self,
        kind: ClientKind,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = Client {
            id: ClientId::new(),
            kind,
            controlled: false,
            sender,
        };
        let id = client.id;
        self.clients.write().await.insert(id, client);
        trace!(?id, ?kind, "client connected");
        (id, receiver)
    }

    /// Disconnect a client. Returns whether it was connected.
    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.clients.write().await.remove(&id).is_some()
    }

    /// Get a snapshot of a connected client.
    pub async fn get(&self, id: ClientId) -> Option<Client> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Take control of every connected client, without waiting for
    /// navigation. Returns how many were newly claimed.
    pub async fn claim_all(&self) -> usize {
        let mut clients = self.clients.write().await;
        let mut claimed = 0;
        for client in clients.values_mut() {
            if !client.controlled {
                client.controlled = true;
                claimed += 1;
            }
        }
        claimed
    }

    /// Number of connected clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Whether no clients are connected.
    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Number of clients under this worker's control.
    pub async fn controlled_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.controlled)
            .count()
    }

    /// Broadcast a version change to every connected page client,
    /// controlled or not.
    ///
    /// Fire and forget: no acknowledgment is awaited, a closed channel is
    /// skipped, and an empty registry is a no-op. Returns how many clients
    /// the message was delivered to.
    pub async fn notify_version_update(&self, version: &BuildVersion) -> usize {
        let clients = self.clients.read().await;
        let mut delivered = 0;
        for client in clients.values().filter(|c| c.kind == ClientKind::Page) {
            let message = ClientMessage::VersionUpdate {
                version: version.as_str().to_string(),
            };
            if client.sender.send(message).is_ok() {
                delivered += 1;
            }
        }
        debug!(delivered, version = %version, "version update broadcast");
        delivered
    }
}

// ==================== Fetch Policy ====================

/// Terminal outcome of one intercepted request.
///
/// Callers pattern-match instead of catching; a [`FetchOutcome::Failed`]
/// affects only the request that produced it.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Served from a store; the network was never touched.
    Hit(Response),
    /// Fetched from the network. `stored` reports whether the response was
    /// written back to the shell store.
    Network { response: Response, stored: bool },
    /// The network fetch failed; nothing was cached.
    Failed(FetchError),
}

impl FetchOutcome {
    /// The response, if the request produced one.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Hit(response) => Some(response),
            FetchOutcome::Network { response, .. } => Some(response),
            FetchOutcome::Failed(_) => None,
        }
    }

    /// Whether the response came from a store.
    pub fn is_hit(&self) -> bool {
        matches!(self, FetchOutcome::Hit(_))
    }

    /// Whether the request failed outright.
    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}

/// Cache-first fetch decision, one call per intercepted request.
///
/// Mutating requests bypass the stores entirely. Eligible requests are
/// looked up across every live store; a hit is served without network I/O.
/// On a miss the real request is issued, and a fully-successful same-origin
/// response is written back to the shell store before being returned.
pub struct FetchPolicy {
    stores: StoreRegistry,
    backend: Arc<dyn FetchBackend>,
    origin: Url,
    shell_store: String,
}

impl FetchPolicy {
    /// Create the policy for one worker generation.
    pub fn new(
        stores: StoreRegistry,
        backend: Arc<dyn FetchBackend>,
        origin: Url,
        shell_store: impl Into<String>,
    ) -> Self {
        Self {
            stores,
            backend,
            origin,
            shell_store: shell_store.into(),
        }
    }

    /// Decide cache-or-network for one request.
    pub async fn handle(&self, request: &Request) -> FetchOutcome {
        if request.is_mutation() {
            trace!(method = %request.method, url = %request.url, "mutation, straight to network");
            return self.from_network(request, false).await;
        }

        let key = request_key(request);
        if let Some(entry) = self.stores.lookup(&key).await {
            match response_from_entry(&entry) {
                Some(response) => {
                    debug!(key = %key, "served from store");
                    return FetchOutcome::Hit(response);
                }
                // An entry that no longer decodes is treated as a miss.
                None => warn!(key = %key, "undecodable store entry ignored"),
            }
        }

        self.from_network(request, true).await
    }

    async fn from_network(&self, request: &Request, eligible: bool) -> FetchOutcome {
        match self.backend.fetch(request).await {
            Ok(response) => {
                let stored = eligible && self.qualifies_for_store(&response);
                if stored {
                    let entry = entry_from_response(request, &response);
                    if let Err(error) = self.stores.insert_into(&self.shell_store, entry).await {
                        warn!(%error, url = %request.url, "write-back failed");
                        return FetchOutcome::Network {
                            response,
                            stored: false,
                        };
                    }
                    trace!(url = %request.url, "response written back");
                }
                FetchOutcome::Network { response, stored }
            }
            Err(error) => {
                debug!(url = %request.url, %error, "network fetch failed");
                FetchOutcome::Failed(error)
            }
        }
    }

    /// A response qualifies for storage only when its status is exactly 200
    /// and its final URL is same-origin. Everything else passes through
    /// uncached.
    fn qualifies_for_store(&self, response: &Response) -> bool {
        response.status == StatusCode::OK
            && classify(&self.origin, &response.url) == ResponseClass::Basic
    }
}

fn request_key(request: &Request) -> RequestKey {
    RequestKey::new(request.method.as_str(), request.url.as_str())
}

fn entry_from_response(request: &Request, response: &Response) -> StoreEntry {
    let mut headers = HashMap::new();
    for (name, value) in response.headers.iter() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    StoreEntry::new(
        request_key(request),
        response.status.as_u16(),
        headers,
        response.body.to_vec(),
    )
}

fn response_from_entry(entry: &StoreEntry) -> Option<Response> {
    let url = Url::parse(entry.key.url()).ok()?;
    let status = StatusCode::from_u16(entry.status).ok()?;
    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            headers.insert(name, value);
        }
    }
    Some(Response {
        status,
        headers,
        body: Bytes::from(entry.body.clone()),
        url,
    })
}

// ==================== Offline Worker ====================

/// One worker instance for one deployment.
///
/// The store registry is shared with the host and with any successor
/// instance; that is how cached entries persist across worker restarts
/// until a newer generation's activation deletes their store.
pub struct OfflineWorker {
    config: WorkerConfig,
    names: StoreNames,
    stores: StoreRegistry,
    clients: ClientRegistry,
    backend: Arc<dyn FetchBackend>,
    policy: FetchPolicy,
    state: Arc<RwLock<WorkerState>>,
    skip_waiting: AtomicBool,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl OfflineWorker {
    /// Create a worker instance over the origin's store registry.
    pub fn new(
        config: WorkerConfig,
        stores: StoreRegistry,
        backend: Arc<dyn FetchBackend>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let names = StoreNames::for_version(config.version());
        let policy = FetchPolicy::new(
            stores.clone(),
            Arc::clone(&backend),
            config.origin().clone(),
            names.shell(),
        );

        (
            Self {
                config,
                names,
                stores,
                clients: ClientRegistry::new(),
                backend,
                policy,
                state: Arc::new(RwLock::new(WorkerState::Idle)),
                skip_waiting: AtomicBool::new(false),
                event_tx,
            },
            event_rx,
        )
    }

    /// The deployment's version token.
    pub fn version(&self) -> &BuildVersion {
        self.config.version()
    }

    /// This generation's store names.
    pub fn store_names(&self) -> &StoreNames {
        &self.names
    }

    /// The shared store registry.
    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// The connected-client registry.
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Whether install signalled that this instance skips waiting.
    pub fn skips_waiting(&self) -> bool {
        self.skip_waiting.load(Ordering::Relaxed)
    }

    /// Dispatch one lifecycle event.
    ///
    /// The match below is the worker's entire inbound protocol; there is no
    /// other registration mechanism and no ordering dependency between
    /// handlers.
    pub async fn handle_event(&self, event: LifecycleEvent) -> Result<EventOutcome, WorkerError> {
        match event {
            LifecycleEvent::Install => {
                self.install().await?;
                Ok(EventOutcome::Installed)
            }
            LifecycleEvent::Activate => {
                self.activate().await?;
                Ok(EventOutcome::Activated)
            }
            LifecycleEvent::Fetch(request) => {
                Ok(EventOutcome::Fetch(self.policy.handle(&request).await))
            }
        }
    }

    /// Install: open both stores and pre-cache the manifest.
    ///
    /// The two store populations run concurrently with no mutual ordering;
    /// both must finish before install succeeds. Any manifest URL failing
    /// to fetch fails the whole install and the instance is discarded.
    async fn install(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Installing).await?;
        info!(version = %self.config.version(), "installing");

        let manifest = self.config.manifest();
        let (shell, assets) = tokio::join!(
            self.populate(self.names.shell(), &manifest.shell),
            self.populate(self.names.assets(), &manifest.assets),
        );

        if let Err(error) = shell.and(assets) {
            let _ = self.transition(WorkerState::Defunct).await;
            return Err(error);
        }

        // The new generation is complete; don't wait behind older instances.
        self.skip_waiting.store(true, Ordering::Relaxed);
        self.publish(WorkerEvent::SkipWaitingRequested);

        self.transition(WorkerState::Installed).await
    }

    /// Fetch every URL of one manifest list, then store the batch.
    ///
    /// Entries are inserted only after every fetch succeeded, so a failed
    /// install never leaves a partially populated store behind.
    async fn populate(&self, store: &str, urls: &[String]) -> Result<(), WorkerError> {
        self.stores.open(store).await;
        let entries = try_join_all(urls.iter().map(|raw| self.precache(raw))).await?;
        for entry in entries {
            self.stores.insert_into(store, entry).await?;
        }
        debug!(store, count = urls.len(), "store populated");
        Ok(())
    }

    async fn precache(&self, raw: &str) -> Result<StoreEntry, WorkerError> {
        let url = self
            .config
            .origin()
            .join(raw)
            .map_err(|e| WorkerError::InstallFailed(format!("invalid manifest URL {raw}: {e}")))?;
        let request = Request::get(url);

        let response = self
            .backend
            .fetch(&request)
            .await
            .map_err(|e| WorkerError::InstallFailed(format!("{raw}: {e}")))?;
        if !response.is_success() {
            return Err(WorkerError::InstallFailed(format!(
                "{raw}: status {}",
                response.status
            )));
        }

        Ok(entry_from_response(&request, &response))
    }

    /// Activate: claim clients, prune stale stores, announce the version.
    ///
    /// Claiming happens first, cleanup second; activation succeeds once
    /// cleanup finishes. The broadcast afterwards is best-effort. An
    /// individual store that fails to delete is logged and skipped; the
    /// version-independent asset store is deliberately left untouched.
    async fn activate(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Activating).await?;
        info!(version = %self.config.version(), "activating");

        let claimed = self.clients.claim_all().await;
        debug!(claimed, "clients claimed");

        for name in self.stores.names().await {
            if self.names.contains(&name) {
                continue;
            }
            match self.stores.remove(&name).await {
                Ok(true) => debug!(store = %name, "stale store deleted"),
                Ok(false) => {}
                Err(error) => warn!(store = %name, %error, "stale store deletion failed"),
            }
        }

        self.transition(WorkerState::Active).await?;

        self.clients
            .notify_version_update(self.config.version())
            .await;
        self.publish(WorkerEvent::VersionActivated {
            version: self.config.version().clone(),
        });

        Ok(())
    }

    async fn transition(&self, to: WorkerState) -> Result<(), WorkerError> {
        let mut state = self.state.write().await;
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(WorkerError::InvalidTransition { from, to });
        }
        *state = to;
        drop(state);

        debug!(?from, ?to, "lifecycle transition");
        self.publish(WorkerEvent::StateChanged { from, to });
        Ok(())
    }

    fn publish(&self, event: WorkerEvent) {
        // The observer may have gone away; that is not an error.
        let _ = self.event_tx.send(event);
    }
}
