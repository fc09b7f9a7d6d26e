// REST client for the remote profile-store API.
//
// Responses are decoded into the typed structs below once, here, and turned
// into model records. Callers never see raw JSON.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::{NewBot, ProfileStore, StoreError, StoreOutcome};
use crate::model::{BotId, BotRecord, UserId, UserProfile, UserWithBots};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Identifiers arrive either as JSON numbers or as numeric strings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Number(i64),
    Text(String),
}

impl IdRepr {
    fn as_i64(&self) -> Result<i64, StoreError> {
        match self {
            IdRepr::Number(n) => Ok(*n),
            IdRepr::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| StoreError::Decode(format!("non-numeric id {s:?}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    telegram_id: IdRepr,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    bio: Option<String>,
    #[serde(default)]
    interests: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    bots: Vec<ApiBot>,
}

#[derive(Debug, Deserialize)]
struct ApiBot {
    id: IdRepr,
    #[serde(default, alias = "owner_id")]
    telegram_id: Option<IdRepr>,
    #[serde(default, alias = "name")]
    bot_name: Option<String>,
    #[serde(default)]
    bot_username: Option<String>,
    #[serde(default, alias = "description")]
    bot_description: Option<String>,
    #[serde(default, alias = "purpose")]
    bot_purpose: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UsersPayload {
    List(Vec<ApiUser>),
    Wrapped { users: Vec<ApiUser> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BotsPayload {
    List(Vec<ApiBot>),
    Wrapped { bots: Vec<ApiBot> },
}

#[derive(Debug, Serialize)]
struct UpsertUserBody<'a> {
    telegram_id: String,
    username: &'a str,
}

#[derive(Debug, Default, Serialize)]
struct ProfilePatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    bio: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interests: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    full_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct CreateBotBody<'a> {
    telegram_id: String,
    bot_name: &'a str,
    bot_username: &'a str,
    description: &'a str,
    bot_purpose: &'a str,
}

impl ApiUser {
    fn into_profile(self, fallback_name: &str) -> Result<UserWithBots, StoreError> {
        let id = self.telegram_id.as_i64()?;
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        let bots = self
            .bots
            .into_iter()
            .map(|bot| bot.into_record(id, None))
            .collect::<Result<Vec<_>, _>>()?;
        let profile = UserProfile {
            id,
            display_name: self
                .full_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| fallback_name.to_string()),
            handle: self.username.filter(|h| !h.is_empty()),
            bio: self.bio,
            interests: self.interests,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        };
        Ok(UserWithBots { profile, bots })
    }
}

impl ApiBot {
    /// Fields the API leaves out are filled from the request that created
    /// the bot, when there was one.
    fn into_record(self, owner_id: UserId, sent: Option<&NewBot>) -> Result<BotRecord, StoreError> {
        let owner_id = match &self.telegram_id {
            Some(id) => id.as_i64()?,
            None => owner_id,
        };
        let now = Utc::now();
        let created_at = self.created_at.unwrap_or(now);
        Ok(BotRecord {
            id: self.id.as_i64()?,
            owner_id,
            name: self
                .bot_name
                .or_else(|| sent.map(|b| b.name.clone()))
                .unwrap_or_default(),
            handle: self
                .bot_username
                .or_else(|| sent.and_then(|b| b.handle.clone())),
            description: self
                .bot_description
                .or_else(|| sent.and_then(|b| b.description.clone())),
            purpose: self
                .bot_purpose
                .or_else(|| sent.and_then(|b| b.purpose.clone())),
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
        })
    }
}

// ---------------------------------------------------------------------------
// Status handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Success,
    NotFound,
    Error,
}

fn classify_status(status: u16) -> StatusClass {
    match status {
        200 | 201 | 204 => StatusClass::Success,
        404 => StatusClass::NotFound,
        _ => StatusClass::Error,
    }
}

/// The `message` field of an error body, or "Unknown error".
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Profile store backed by the remote REST API.
pub struct ApiStore {
    client: Client,
    base_url: String,
}

impl ApiStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `true` when `GET /health` answers 200.
    pub async fn ping(&self) -> bool {
        match self
            .client
            .get(self.url("/health"))
            .timeout(PING_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                debug!("Profile API ping status: {}", response.status());
                response.status().as_u16() == 200
            }
            Err(e) => {
                warn!("Profile API ping failed: {e}");
                false
            }
        }
    }

    /// Send a request and decode the success body. 404 yields `Ok(None)`.
    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<Option<T>, StoreError> {
        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status().as_u16();

        match classify_status(status) {
            StatusClass::Success => response
                .json::<T>()
                .await
                .map(Some)
                .map_err(|e| StoreError::Decode(e.to_string())),
            StatusClass::NotFound => Ok(None),
            StatusClass::Error => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Status {
                    status,
                    message: extract_error_message(&body),
                })
            }
        }
    }

    async fn fetch_user(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        let user: Option<ApiUser> = self
            .call(self.client.get(self.url(&format!("/user/{id}"))))
            .await?;
        user.map(|u| u.into_profile("").map(|p| p.profile))
            .transpose()
    }

    async fn upsert_user(
        &self,
        id: UserId,
        handle: Option<&str>,
        display_name: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        let body = UpsertUserBody {
            telegram_id: id.to_string(),
            username: handle.unwrap_or(""),
        };
        let Some(created) = self
            .call::<ApiUser>(self.client.post(self.url("/user")).json(&body))
            .await?
        else {
            return Ok(None);
        };
        let created = created.into_profile(display_name)?.profile;

        // The upsert endpoint does not take a display name; set it separately.
        let patch = ProfilePatch {
            full_name: Some(display_name),
            ..Default::default()
        };
        match self.patch_user(id, &patch).await {
            Ok(Some(updated)) => Ok(Some(updated)),
            Ok(None) => {
                warn!("User {id} vanished before its display name could be set");
                Ok(Some(created))
            }
            Err(e) => {
                warn!("Failed to set display name of user {id}: {e}");
                Ok(Some(created))
            }
        }
    }

    async fn patch_user(
        &self,
        id: UserId,
        patch: &ProfilePatch<'_>,
    ) -> Result<Option<UserProfile>, StoreError> {
        let user: Option<ApiUser> = self
            .call(self.client.put(self.url(&format!("/user/{id}"))).json(patch))
            .await?;
        user.map(|u| u.into_profile(patch.full_name.unwrap_or("")).map(|p| p.profile))
            .transpose()
    }

    async fn fetch_users(&self) -> Result<Vec<UserWithBots>, StoreError> {
        let payload: Option<UsersPayload> = self.call(self.client.get(self.url("/users"))).await?;
        let users = match payload {
            Some(UsersPayload::List(users)) | Some(UsersPayload::Wrapped { users }) => users,
            None => Vec::new(),
        };
        users.into_iter().map(|u| u.into_profile("")).collect()
    }

    async fn post_bot(&self, bot: &NewBot) -> Result<Option<BotRecord>, StoreError> {
        let body = CreateBotBody {
            telegram_id: bot.owner_id.to_string(),
            bot_name: &bot.name,
            bot_username: bot.handle.as_deref().unwrap_or(""),
            description: bot.description.as_deref().unwrap_or(""),
            bot_purpose: bot.purpose.as_deref().unwrap_or(""),
        };
        let created: Option<ApiBot> = self
            .call(self.client.post(self.url("/bot")).json(&body))
            .await?;
        created
            .map(|b| b.into_record(bot.owner_id, Some(bot)))
            .transpose()
    }

    async fn fetch_bots(&self, owner_id: UserId) -> Result<Option<Vec<BotRecord>>, StoreError> {
        let payload: Option<BotsPayload> = self
            .call(self.client.get(self.url(&format!("/user/{owner_id}/bots"))))
            .await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let bots = match payload {
            BotsPayload::List(bots) | BotsPayload::Wrapped { bots } => bots,
        };
        bots.into_iter()
            .map(|b| b.into_record(owner_id, None))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn remove_bot(&self, id: BotId) -> Result<StatusClass, StoreError> {
        let response = self
            .client
            .delete(self.url(&format!("/bot/{id}")))
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        match classify_status(status) {
            StatusClass::Error => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Status {
                    status,
                    message: extract_error_message(&body),
                })
            }
            class => Ok(class),
        }
    }
}

#[async_trait]
impl ProfileStore for ApiStore {
    async fn get_user(&self, id: UserId) -> StoreOutcome<UserProfile> {
        let outcome: StoreOutcome<UserProfile> = self.fetch_user(id).await.into();
        match &outcome {
            StoreOutcome::Found(_) => debug!("User retrieved: {id}"),
            StoreOutcome::NotFound => debug!("User not found: {id}"),
            StoreOutcome::Failed(err) => error!("Failed to get user {id}: {err}"),
        }
        outcome
    }

    async fn create_user(
        &self,
        id: UserId,
        handle: Option<&str>,
        display_name: &str,
    ) -> StoreOutcome<UserProfile> {
        let outcome: StoreOutcome<UserProfile> =
            self.upsert_user(id, handle, display_name).await.into();
        match &outcome {
            StoreOutcome::Found(_) => info!("User upserted: {id}"),
            StoreOutcome::NotFound => warn!("Upsert of user {id} answered 404"),
            StoreOutcome::Failed(err) => error!("Failed to upsert user {id}: {err}"),
        }
        outcome
    }

    async fn update_profile(
        &self,
        id: UserId,
        bio: Option<&str>,
        interests: Option<&str>,
    ) -> StoreOutcome<UserProfile> {
        let patch = ProfilePatch {
            bio,
            interests,
            full_name: None,
        };
        let outcome: StoreOutcome<UserProfile> = self.patch_user(id, &patch).await.into();
        match &outcome {
            StoreOutcome::Found(_) => info!("User profile updated: {id}"),
            StoreOutcome::NotFound => debug!("Profile update for unknown user {id}"),
            StoreOutcome::Failed(err) => error!("Failed to update profile of user {id}: {err}"),
        }
        outcome
    }

    async fn list_users_with_bots(&self) -> StoreOutcome<Vec<UserWithBots>> {
        match self.fetch_users().await {
            Ok(users) => {
                debug!("Retrieved {} users", users.len());
                StoreOutcome::Found(users)
            }
            Err(err) => {
                error!("Failed to list users: {err}");
                StoreOutcome::Failed(err)
            }
        }
    }

    async fn create_bot(&self, bot: NewBot) -> StoreOutcome<BotRecord> {
        let outcome: StoreOutcome<BotRecord> = self.post_bot(&bot).await.into();
        match &outcome {
            StoreOutcome::Found(record) => {
                info!("Bot added: #{} ({}) for user {}", record.id, record.name, bot.owner_id)
            }
            StoreOutcome::NotFound => warn!("Bot creation for user {} answered 404", bot.owner_id),
            StoreOutcome::Failed(err) => {
                error!("Failed to add bot {} for user {}: {err}", bot.name, bot.owner_id)
            }
        }
        outcome
    }

    async fn list_bots_by_owner(&self, owner_id: UserId) -> StoreOutcome<Vec<BotRecord>> {
        let outcome: StoreOutcome<Vec<BotRecord>> = self.fetch_bots(owner_id).await.into();
        if let StoreOutcome::Failed(err) = &outcome {
            error!("Failed to get bots of user {owner_id}: {err}");
        }
        outcome
    }

    async fn delete_bot(&self, id: BotId) -> bool {
        match self.remove_bot(id).await {
            Ok(StatusClass::NotFound) => {
                warn!("Bot #{id} not found for deletion");
                true
            }
            Ok(_) => {
                info!("Bot deleted: #{id}");
                true
            }
            Err(err) => {
                error!("Failed to delete bot #{id}: {err}");
                false
            }
        }
    }
}
