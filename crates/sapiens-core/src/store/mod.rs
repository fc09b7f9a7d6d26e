// Profile store contract and its backends.
//
// Every backend answers with a tri-state `StoreOutcome`: data, a legitimate
// "not found", or a backend failure. Transport and database errors are caught
// inside the backend; nothing above this module handles them.

pub mod api;
pub mod mirror;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::{Config, StoreBackend};
use crate::model::{BotId, BotRecord, UserId, UserProfile, UserWithBots};

pub use api::ApiStore;
pub use mirror::MirroredStore;
pub use sqlite::SqliteStore;

// ---------------------------------------------------------------------------
// Outcome and error types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("network error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Result of a single store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome<T> {
    Found(T),
    NotFound,
    Failed(StoreError),
}

impl<T> StoreOutcome<T> {
    /// The payload, if any. Collapses not-found and failure; only use where
    /// both mean "nothing to show".
    pub fn found(self) -> Option<T> {
        match self {
            StoreOutcome::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, StoreOutcome::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StoreOutcome<U> {
        match self {
            StoreOutcome::Found(value) => StoreOutcome::Found(f(value)),
            StoreOutcome::NotFound => StoreOutcome::NotFound,
            StoreOutcome::Failed(err) => StoreOutcome::Failed(err),
        }
    }
}

impl<T> From<Result<Option<T>, StoreError>> for StoreOutcome<T> {
    fn from(result: Result<Option<T>, StoreError>) -> Self {
        match result {
            Ok(Some(value)) => StoreOutcome::Found(value),
            Ok(None) => StoreOutcome::NotFound,
            Err(err) => StoreOutcome::Failed(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Fields for a new bot record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewBot {
    pub owner_id: UserId,
    pub name: String,
    pub handle: Option<String>,
    pub description: Option<String>,
    pub purpose: Option<String>,
}

/// Persistence for user profiles and their bots. Every lookup, update and
/// delete is keyed by identity, never by name or handle.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_user(&self, id: UserId) -> StoreOutcome<UserProfile>;

    /// Insert the user or refresh handle and display name if the id is
    /// already known. Never creates a second row for the same id.
    async fn create_user(
        &self,
        id: UserId,
        handle: Option<&str>,
        display_name: &str,
    ) -> StoreOutcome<UserProfile>;

    /// Change only the supplied fields; `None` leaves a field untouched.
    async fn update_profile(
        &self,
        id: UserId,
        bio: Option<&str>,
        interests: Option<&str>,
    ) -> StoreOutcome<UserProfile>;

    /// All users with their bots. An empty store yields `Found(vec![])`.
    async fn list_users_with_bots(&self) -> StoreOutcome<Vec<UserWithBots>>;

    async fn create_bot(&self, bot: NewBot) -> StoreOutcome<BotRecord>;

    async fn list_bots_by_owner(&self, owner_id: UserId) -> StoreOutcome<Vec<BotRecord>>;

    /// `true` when the bot is gone afterwards, whether or not it existed.
    /// `false` only on a backend error.
    async fn delete_bot(&self, id: BotId) -> bool;
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build the store selected by `config.store`.
pub fn open_from_config(config: &Config) -> anyhow::Result<Arc<dyn ProfileStore>> {
    let store_config = &config.store;
    match store_config.backend {
        StoreBackend::Sqlite => {
            let sqlite = SqliteStore::open(&store_config.database_path)
                .context("failed to open profile database")?;
            info!("Profile store: sqlite at {}", store_config.database_path);

            let mirror_url = store_config
                .api_url
                .as_deref()
                .filter(|_| store_config.mirror_to_api);
            match mirror_url {
                Some(url) => {
                    let api = ApiStore::new(url).context("failed to build mirror API client")?;
                    info!("Mirroring new users and bots to {url}");
                    Ok(Arc::new(MirroredStore::new(sqlite, api)))
                }
                None => Ok(Arc::new(sqlite)),
            }
        }
        StoreBackend::Api => {
            let url = store_config
                .api_url
                .as_deref()
                .context("store.api_url is required for the api backend")?;
            info!("Profile store: remote API at {url}");
            Ok(Arc::new(
                ApiStore::new(url).context("failed to build profile API client")?,
            ))
        }
    }
}
