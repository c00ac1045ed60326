// =============================================================================
// Matrixon Client SDK - Sync Store
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
//   Persistence contract for the sync loop's resume cursor and filter id,
//   keyed per account. Two implementations: an in-memory store (lost on
//   restart) and a server-backed store that round-trips the cursor through
//   the account-data endpoints, so a client can resume across restarts
//   without local storage.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reqwest::Method;
use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use matrixon_client_common::{ClientError, Result};

use crate::http::{client_api_url, HttpExecutor, HttpRequest};

/// Default account-data event type the server-backed store writes under.
pub const DEFAULT_SYNC_STORE_EVENT_TYPE: &str = "org.matrixon.client.sync_store";

/// Cursor and filter-id persistence for the sync loop.
///
/// Only the task running the sync loop calls these methods; implementations
/// need no concurrency guarantees beyond that single caller.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// The last persisted resume cursor, or `None` before the first sync.
    async fn load_cursor(&self, user_id: &UserId) -> Result<Option<String>>;
    async fn save_cursor(&self, user_id: &UserId, cursor: &str) -> Result<()>;
    /// The server-stored filter id, or `None` if one was never created.
    async fn load_filter_id(&self, user_id: &UserId) -> Result<Option<String>>;
    async fn save_filter_id(&self, user_id: &UserId, filter_id: &str) -> Result<()>;
}

/// In-memory sync store. Cursors do not survive a restart, so every process
/// start performs an initial sync.
#[derive(Debug, Default)]
pub struct MemorySyncStore {
    cursors: RwLock<HashMap<OwnedUserId, String>>,
    filter_ids: RwLock<HashMap<OwnedUserId, String>>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn load_cursor(&self, user_id: &UserId) -> Result<Option<String>> {
        Ok(self
            .cursors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned())
    }

    async fn save_cursor(&self, user_id: &UserId, cursor: &str) -> Result<()> {
        self.cursors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_owned(), cursor.to_string());
        Ok(())
    }

    async fn load_filter_id(&self, user_id: &UserId) -> Result<Option<String>> {
        Ok(self
            .filter_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned())
    }

    async fn save_filter_id(&self, user_id: &UserId, filter_id: &str) -> Result<()> {
        self.filter_ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_owned(), filter_id.to_string());
        Ok(())
    }
}

/// Wire shape of the cursor stored as account data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextBatchContent {
    pub next_batch: String,
}

/// Sync store persisted on the homeserver as account data.
///
/// The cursor is written under `event_type` via
/// `PUT /user/{id}/account_data/{type}` and read back on the next start.
/// Filter ids are only cached in memory: filters are cheap to re-create and
/// differ per client build, so persisting them server-side buys nothing.
pub struct AccountDataSyncStore {
    http: Arc<HttpExecutor>,
    homeserver: Url,
    event_type: String,
    filter_ids: RwLock<HashMap<OwnedUserId, String>>,
}

impl AccountDataSyncStore {
    pub fn new(http: Arc<HttpExecutor>, homeserver: Url) -> Self {
        Self::with_event_type(http, homeserver, DEFAULT_SYNC_STORE_EVENT_TYPE)
    }

    pub fn with_event_type(
        http: Arc<HttpExecutor>,
        homeserver: Url,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            http,
            homeserver,
            event_type: event_type.into(),
            filter_ids: RwLock::new(HashMap::new()),
        }
    }

    fn account_data_url(&self, user_id: &UserId) -> Result<Url> {
        client_api_url(
            &self.homeserver,
            &["user", user_id.as_str(), "account_data", &self.event_type],
        )
    }
}

#[async_trait]
impl SyncStore for AccountDataSyncStore {
    async fn load_cursor(&self, user_id: &UserId) -> Result<Option<String>> {
        let url = self.account_data_url(user_id)?;
        let request = HttpRequest::new(Method::GET, url);
        match self.http.execute::<NextBatchContent>(request).await {
            Ok(content) => Ok(Some(content.next_batch)),
            // No account data of this type yet: first run for this account.
            Err(ClientError::Http {
                status: 404, ..
            }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    async fn save_cursor(&self, user_id: &UserId, cursor: &str) -> Result<()> {
        let url = self.account_data_url(user_id)?;
        let request = HttpRequest::new(Method::PUT, url).with_json(&NextBatchContent {
            next_batch: cursor.to_string(),
        })?;
        debug!(user_id = %user_id, "Persisting sync cursor as account data");
        self.http.execute::<serde_json::Value>(request).await?;
        Ok(())
    }

    async fn load_filter_id(&self, user_id: &UserId) -> Result<Option<String>> {
        Ok(self
            .filter_ids
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned())
    }

    async fn save_filter_id(&self, user_id: &UserId, filter_id: &str) -> Result<()> {
        self.filter_ids
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.to_owned(), filter_id.to_string());
        Ok(())
    }
}
