// =============================================================================
// Matrixon Client SDK - Sync Loop Driver
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-03-21
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The long-poll lifecycle: ensure a server-side filter exists, load the
//   cursor, poll /sync, persist the advanced cursor, hand the response to
//   the syncer, repeat. Each call to sync() supersedes any previous loop on
//   the same client via a generation counter; superseded loops discard
//   their in-flight result without persisting or processing it.
//
// Features:
//   • Crash-safe cursor handling: persist before process (at-most-once)
//   • Generation-based supersede and prompt stop without task handles
//   • Lazy filter provisioning with persisted filter id
//   • Long-poll timeout decoupled from the transport timeout
//
// =============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Method;
use ruma::{OwnedUserId, UserId};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use url::Url;

use matrixon_client_common::{ClientError, Result};

use crate::http::{client_api_url, HttpExecutor, HttpExecutorConfig, HttpRequest, RequestObserver};
use crate::responses::{Filter, RespCreateFilter, SyncResponse};
use crate::store::{MemorySyncStore, SyncStore};
use crate::sync::{DefaultSyncer, Syncer};

/// Default long-poll timeout requested from the server.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra transport headroom on top of the requested long-poll timeout.
const SYNC_TRANSPORT_MARGIN: Duration = Duration::from_secs(10);

/// Round trips longer than the requested timeout plus this margin are
/// logged. Initial syncs get far more slack because they can be huge.
const SYNC_WARN_MARGIN: Duration = Duration::from_secs(10);
const INITIAL_SYNC_WARN_MARGIN: Duration = Duration::from_secs(120);

/// Presence value advertised while polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceState {
    Online,
    Offline,
    Unavailable,
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresenceState::Online => f.write_str("online"),
            PresenceState::Offline => f.write_str("offline"),
            PresenceState::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// A Matrix client bound to one homeserver and one user.
///
/// Cheap to share: every field is behind an `Arc` or copyable. Exactly one
/// sync loop is active per client; starting another supersedes the first.
pub struct Client {
    homeserver: Url,
    user_id: OwnedUserId,
    http: Arc<HttpExecutor>,
    store: Arc<dyn SyncStore>,
    syncer: Arc<dyn Syncer>,
    sync_timeout: Duration,
    set_presence: Option<PresenceState>,
    full_state: bool,
    // Each sync() bumps the generation; loops observing a newer value stop.
    generation: watch::Sender<u64>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("homeserver", &self.homeserver.as_str())
            .field("user_id", &self.user_id)
            .field("sync_timeout", &self.sync_timeout)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Start configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn homeserver(&self) -> &Url {
        &self.homeserver
    }

    /// The shared request executor, for endpoint calls outside the loop.
    pub fn http(&self) -> &Arc<HttpExecutor> {
        &self.http
    }

    /// The cursor/filter store backing this client.
    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    /// The response processor driving listener dispatch.
    pub fn syncer(&self) -> &Arc<dyn Syncer> {
        &self.syncer
    }

    /// Replace the access token used for all subsequent requests.
    pub fn set_access_token(&self, token: Option<String>) {
        self.http.set_access_token(token);
    }

    /// Run the sync loop until it fails fatally or is superseded/stopped.
    ///
    /// Returns `Ok(())` when superseded or stopped, `Err` on a fatal failure
    /// (filter creation, store I/O, a processing error, or a failure the
    /// syncer declared terminal). The cursor for a poll is persisted BEFORE
    /// its response is processed, so a listener crash never replays the
    /// batch that killed it.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn sync(&self) -> Result<()> {
        let mut my_generation = 0;
        self.generation.send_modify(|g| {
            *g += 1;
            my_generation = *g;
        });
        let mut generation_rx = self.generation.subscribe();

        info!("🔧 Starting sync loop (generation {my_generation})");

        let filter_id = self.ensure_filter_id().await?;
        let mut since = self
            .store
            .load_cursor(&self.user_id)
            .await?
            .unwrap_or_default();
        let mut initial = since.is_empty();

        loop {
            if *generation_rx.borrow() != my_generation {
                info!("✅ Sync loop superseded, stopping cleanly");
                return Ok(());
            }

            let started = Instant::now();
            let poll = tokio::select! {
                result = self.sync_once(&since, &filter_id, initial) => result,
                _ = generation_rx.changed() => {
                    info!("✅ Sync loop superseded while polling, stopping cleanly");
                    return Ok(());
                }
            };

            let elapsed = started.elapsed();
            let margin = if initial {
                INITIAL_SYNC_WARN_MARGIN
            } else {
                SYNC_WARN_MARGIN
            };
            if elapsed > self.sync_timeout + margin {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    timeout_ms = self.sync_timeout.as_millis() as u64,
                    "Sync round trip took much longer than the requested timeout"
                );
            }

            let response = match poll {
                Ok(response) => response,
                Err(error) => {
                    let wait = self.syncer.on_failed_sync(&error)?;
                    debug!("Sync poll failed ({error}), retrying in {wait:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = generation_rx.changed() => {
                            info!("✅ Sync loop superseded during backoff, stopping cleanly");
                            return Ok(());
                        }
                    }
                    continue;
                }
            };

            // Result of a superseded poll is discarded without persisting
            // or processing; the newer loop owns the cursor now.
            if *generation_rx.borrow() != my_generation {
                info!("✅ Sync loop superseded, discarding in-flight response");
                return Ok(());
            }

            let next_batch = response.next_batch.clone();
            self.store.save_cursor(&self.user_id, &next_batch).await?;
            let dispatched = self.syncer.process_response(response, &since)?;
            debug!(
                next_batch = %next_batch,
                dispatched,
                "✅ Sync batch processed"
            );
            since = next_batch;
            initial = false;
        }
    }

    /// Stop the active sync loop without starting a new one. The loop exits
    /// at its next supersede check; an in-flight poll is abandoned.
    pub fn stop_sync(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// One long poll against `/sync`. Exactly one attempt: the loop owns
    /// retry policy, not the transport. The transport timeout leaves extra
    /// headroom on the initial sync, which can take far longer to assemble.
    async fn sync_once(&self, since: &str, filter_id: &str, initial: bool) -> Result<SyncResponse> {
        let mut url = client_api_url(&self.homeserver, &["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &self.sync_timeout.as_millis().to_string());
            query.append_pair("filter", filter_id);
            if !since.is_empty() {
                query.append_pair("since", since);
            }
            if let Some(presence) = self.set_presence {
                query.append_pair("set_presence", &presence.to_string());
            }
            if self.full_state {
                query.append_pair("full_state", "true");
            }
        }
        let headroom = if initial {
            INITIAL_SYNC_WARN_MARGIN
        } else {
            SYNC_TRANSPORT_MARGIN
        };
        let request = HttpRequest::new(Method::GET, url)
            .with_max_attempts(1)
            .with_timeout(self.sync_timeout + headroom);
        self.http.execute(request).await
    }

    /// Return the persisted filter id, creating and persisting one first if
    /// the store has none. Any failure here is fatal to the loop: polling
    /// unfiltered would silently change what the server sends.
    async fn ensure_filter_id(&self) -> Result<String> {
        if let Some(filter_id) = self.store.load_filter_id(&self.user_id).await? {
            return Ok(filter_id);
        }
        let filter = self.syncer.filter_definition(&self.user_id);
        let filter_id = self
            .create_filter(&filter)
            .await
            .map_err(|e| ClientError::FilterCreation(Box::new(e)))?;
        self.store.save_filter_id(&self.user_id, &filter_id).await?;
        info!(filter_id = %filter_id, "✅ Sync filter created");
        Ok(filter_id)
    }

    /// Upload a filter definition, returning the server-assigned id.
    pub async fn create_filter(&self, filter: &Filter) -> Result<String> {
        let url = client_api_url(
            &self.homeserver,
            &["user", self.user_id.as_str(), "filter"],
        )?;
        let request = HttpRequest::new(Method::POST, url).with_json(filter)?;
        let response: RespCreateFilter = self.http.execute(request).await?;
        Ok(response.filter_id)
    }
}

/// Which cursor/filter store the builder wires up.
enum StoreChoice {
    /// Volatile; every restart is an initial sync
    Memory,
    /// Account data on the homeserver, under a client-private event type
    ServerAccountData,
    Custom(Arc<dyn SyncStore>),
}

/// Builder for [`Client`]. `homeserver` and `user_id` are required.
pub struct ClientBuilder {
    homeserver: Option<String>,
    user_id: Option<OwnedUserId>,
    access_token: Option<String>,
    user_agent: Option<String>,
    /// Total attempts for ordinary endpoint calls (1 = no retries)
    http_attempts: u32,
    base_backoff: Duration,
    rate_limit_backoff: bool,
    request_timeout: Duration,
    sync_timeout: Duration,
    set_presence: Option<PresenceState>,
    full_state: bool,
    store: StoreChoice,
    syncer: Option<Arc<dyn Syncer>>,
    observers: Vec<Arc<dyn RequestObserver>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            homeserver: None,
            user_id: None,
            access_token: None,
            user_agent: None,
            http_attempts: 1,
            base_backoff: crate::http::DEFAULT_BASE_BACKOFF,
            rate_limit_backoff: true,
            request_timeout: crate::http::DEFAULT_REQUEST_TIMEOUT,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            set_presence: None,
            full_state: false,
            store: StoreChoice::Memory,
            syncer: None,
            observers: Vec::new(),
        }
    }

    /// Homeserver base URL. A bare host gets `https://` prepended.
    pub fn homeserver(mut self, homeserver: impl Into<String>) -> Self {
        self.homeserver = Some(homeserver.into());
        self
    }

    pub fn user_id(mut self, user_id: OwnedUserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Total attempts per ordinary endpoint call. Sync polls always use 1.
    pub fn http_attempts(mut self, attempts: u32) -> Self {
        self.http_attempts = attempts.max(1);
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    /// When disabled, 429 responses surface immediately instead of waiting
    /// out the server's Retry-After.
    pub fn rate_limit_backoff(mut self, enabled: bool) -> Self {
        self.rate_limit_backoff = enabled;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Long-poll timeout requested from the server.
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn set_presence(mut self, presence: PresenceState) -> Self {
        self.set_presence = Some(presence);
        self
    }

    /// Request full room state on every poll instead of deltas.
    pub fn full_state(mut self, full_state: bool) -> Self {
        self.full_state = full_state;
        self
    }

    /// Persist the cursor and filter id as account data on the homeserver,
    /// so restarts resume instead of re-running an initial sync.
    pub fn server_backed_store(mut self) -> Self {
        self.store = StoreChoice::ServerAccountData;
        self
    }

    pub fn store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = StoreChoice::Custom(store);
        self
    }

    pub fn syncer(mut self, syncer: Arc<dyn Syncer>) -> Self {
        self.syncer = Some(syncer);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn RequestObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<Client> {
        let homeserver = self
            .homeserver
            .ok_or_else(|| ClientError::InvalidConfig("homeserver is required".to_string()))?;
        let user_id = self
            .user_id
            .ok_or_else(|| ClientError::InvalidConfig("user_id is required".to_string()))?;

        let homeserver = if homeserver.contains("://") {
            homeserver
        } else {
            format!("https://{homeserver}")
        };
        let homeserver = Url::parse(&homeserver)
            .map_err(|e| ClientError::InvalidConfig(format!("invalid homeserver URL: {e}")))?;

        let mut config = HttpExecutorConfig {
            access_token: self.access_token,
            max_attempts: self.http_attempts,
            base_backoff: self.base_backoff,
            rate_limit_backoff: self.rate_limit_backoff,
            request_timeout: self.request_timeout,
            ..HttpExecutorConfig::default()
        };
        if let Some(user_agent) = self.user_agent {
            config.user_agent = user_agent;
        }
        let http = Arc::new(HttpExecutor::new(config)?);
        for observer in self.observers {
            http.add_observer(observer);
        }

        let store: Arc<dyn SyncStore> = match self.store {
            StoreChoice::Memory => Arc::new(MemorySyncStore::new()),
            StoreChoice::ServerAccountData => Arc::new(
                crate::store::AccountDataSyncStore::new(Arc::clone(&http), homeserver.clone()),
            ),
            StoreChoice::Custom(store) => store,
        };
        let syncer = self
            .syncer
            .unwrap_or_else(|| Arc::new(DefaultSyncer::new()));

        let (generation, _) = watch::channel(0);
        Ok(Client {
            homeserver,
            user_id,
            http,
            store,
            syncer,
            sync_timeout: self.sync_timeout,
            set_presence: self.set_presence,
            full_state: self.full_state,
            generation,
        })
    }
}
