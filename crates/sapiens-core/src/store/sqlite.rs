// SQLite persistence for user profiles and bot records.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{error, info};

use super::{NewBot, ProfileStore, StoreError, StoreOutcome};
use crate::model::{BotId, BotRecord, UserId, UserProfile, UserWithBots};

const NOW: &str = "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')";

const USER_COLUMNS: &str =
    "telegram_id, full_name, username, bio, interests, created_at, updated_at";

const BOT_COLUMNS: &str =
    "id, owner_id, bot_name, bot_username, bot_description, bot_purpose, created_at, updated_at";

/// SQLite-backed profile store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database at `path` and ensure the schema exists.
    /// Pass `":memory:"` for an ephemeral database (useful for tests).
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS users (
                telegram_id INTEGER PRIMARY KEY,
                full_name   TEXT NOT NULL,
                username    TEXT,
                bio         TEXT,
                interests   TEXT,
                created_at  TEXT NOT NULL DEFAULT ({NOW}),
                updated_at  TEXT NOT NULL DEFAULT ({NOW})
            );

            CREATE TABLE IF NOT EXISTS bots (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id        INTEGER NOT NULL REFERENCES users(telegram_id) ON DELETE CASCADE,
                bot_name        TEXT NOT NULL,
                bot_username    TEXT,
                bot_description TEXT,
                bot_purpose     TEXT,
                created_at      TEXT NOT NULL DEFAULT ({NOW}),
                updated_at      TEXT NOT NULL DEFAULT ({NOW})
            );

            CREATE INDEX IF NOT EXISTS idx_bots_owner_id ON bots(owner_id);
            "
        ))
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection mutex poisoned".into()))
    }

    fn query_user(&self, id: UserId) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE telegram_id = ?1"),
            params![id],
            user_from_row,
        )
        .optional()
        .map_err(db_error)
    }

    fn upsert_user(
        &self,
        id: UserId,
        handle: Option<&str>,
        display_name: &str,
    ) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "INSERT INTO users (telegram_id, full_name, username)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(telegram_id) DO UPDATE SET
                    full_name  = excluded.full_name,
                    username   = excluded.username,
                    updated_at = {NOW}
                 RETURNING {USER_COLUMNS}"
            ),
            params![id, display_name, handle],
            user_from_row,
        )
        .map(Some)
        .map_err(db_error)
    }

    fn patch_user(
        &self,
        id: UserId,
        bio: Option<&str>,
        interests: Option<&str>,
    ) -> Result<Option<UserProfile>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "UPDATE users SET
                    bio        = COALESCE(?2, bio),
                    interests  = COALESCE(?3, interests),
                    updated_at = {NOW}
                 WHERE telegram_id = ?1
                 RETURNING {USER_COLUMNS}"
            ),
            params![id, bio, interests],
            user_from_row,
        )
        .optional()
        .map_err(db_error)
    }

    fn query_users_with_bots(&self) -> Result<Vec<UserWithBots>, StoreError> {
        let conn = self.conn()?;

        let mut bots_by_owner: HashMap<UserId, Vec<BotRecord>> = HashMap::new();
        let mut stmt = conn
            .prepare(&format!("SELECT {BOT_COLUMNS} FROM bots ORDER BY id"))
            .map_err(db_error)?;
        let bots = stmt
            .query_map([], bot_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        for bot in bots {
            bots_by_owner.entry(bot.owner_id).or_default().push(bot);
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {USER_COLUMNS} FROM users ORDER BY created_at, telegram_id"
            ))
            .map_err(db_error)?;
        let users = stmt
            .query_map([], user_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;

        Ok(users
            .into_iter()
            .map(|profile| {
                let bots = bots_by_owner.remove(&profile.id).unwrap_or_default();
                UserWithBots { profile, bots }
            })
            .collect())
    }

    fn insert_bot(&self, bot: &NewBot) -> Result<Option<BotRecord>, StoreError> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "INSERT INTO bots (owner_id, bot_name, bot_username, bot_description, bot_purpose)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 RETURNING {BOT_COLUMNS}"
            ),
            params![
                bot.owner_id,
                bot.name,
                bot.handle,
                bot.description,
                bot.purpose,
            ],
            bot_from_row,
        )
        .map(Some)
        .map_err(db_error)
    }

    fn query_bots_by_owner(&self, owner_id: UserId) -> Result<Vec<BotRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {BOT_COLUMNS} FROM bots WHERE owner_id = ?1 ORDER BY id"
            ))
            .map_err(db_error)?;
        let bots = stmt
            .query_map(params![owner_id], bot_from_row)
            .map_err(db_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_error)?;
        Ok(bots)
    }

    fn remove_bot(&self, id: BotId) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM bots WHERE id = ?1", params![id])
            .map_err(db_error)
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get_user(&self, id: UserId) -> StoreOutcome<UserProfile> {
        let outcome: StoreOutcome<UserProfile> = self.query_user(id).into();
        if let StoreOutcome::Failed(err) = &outcome {
            error!("Failed to load user {id}: {err}");
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
            self.upsert_user(id, handle, display_name).into();
        match &outcome {
            StoreOutcome::Found(_) => info!("Upserted user {id}"),
            StoreOutcome::Failed(err) => error!("Failed to upsert user {id}: {err}"),
            StoreOutcome::NotFound => {}
        }
        outcome
    }

    async fn update_profile(
        &self,
        id: UserId,
        bio: Option<&str>,
        interests: Option<&str>,
    ) -> StoreOutcome<UserProfile> {
        let outcome: StoreOutcome<UserProfile> = self.patch_user(id, bio, interests).into();
        match &outcome {
            StoreOutcome::Found(_) => info!("Updated profile of user {id}"),
            StoreOutcome::Failed(err) => error!("Failed to update profile of user {id}: {err}"),
            StoreOutcome::NotFound => {}
        }
        outcome
    }

    async fn list_users_with_bots(&self) -> StoreOutcome<Vec<UserWithBots>> {
        match self.query_users_with_bots() {
            Ok(users) => StoreOutcome::Found(users),
            Err(err) => {
                error!("Failed to list users: {err}");
                StoreOutcome::Failed(err)
            }
        }
    }

    async fn create_bot(&self, bot: NewBot) -> StoreOutcome<BotRecord> {
        let outcome: StoreOutcome<BotRecord> = self.insert_bot(&bot).into();
        match &outcome {
            StoreOutcome::Found(record) => info!(
                "Created bot #{} ({}) for user {}",
                record.id, record.name, record.owner_id
            ),
            StoreOutcome::Failed(err) => {
                error!("Failed to create bot {} for user {}: {err}", bot.name, bot.owner_id)
            }
            StoreOutcome::NotFound => {}
        }
        outcome
    }

    async fn list_bots_by_owner(&self, owner_id: UserId) -> StoreOutcome<Vec<BotRecord>> {
        match self.query_bots_by_owner(owner_id) {
            Ok(bots) => StoreOutcome::Found(bots),
            Err(err) => {
                error!("Failed to list bots of user {owner_id}: {err}");
                StoreOutcome::Failed(err)
            }
        }
    }

    async fn delete_bot(&self, id: BotId) -> bool {
        match self.remove_bot(id) {
            Ok(0) => {
                info!("Bot #{id} already absent");
                true
            }
            Ok(_) => {
                info!("Deleted bot #{id}");
                true
            }
            Err(err) => {
                error!("Failed to delete bot #{id}: {err}");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn db_error(err: rusqlite::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: row.get(0)?,
        display_name: row.get(1)?,
        handle: row.get(2)?,
        bio: row.get(3)?,
        interests: row.get(4)?,
        created_at: timestamp(row, 5)?,
        updated_at: timestamp(row, 6)?,
    })
}

fn bot_from_row(row: &Row<'_>) -> rusqlite::Result<BotRecord> {
    Ok(BotRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        handle: row.get(3)?,
        description: row.get(4)?,
        purpose: row.get(5)?,
        created_at: timestamp(row, 6)?,
        updated_at: timestamp(row, 7)?,
    })
}
