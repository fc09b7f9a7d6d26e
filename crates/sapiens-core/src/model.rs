// Profile records: users, their registered bots, and the nested view used by
// the daily report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform identity of a user (and of their private chat).
pub type UserId = i64;

/// Store-assigned identity of a bot record.
pub type BotId = i64;

/// A registered user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub handle: Option<String>,
    pub bio: Option<String>,
    pub interests: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bot ("species") registered by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: BotId,
    pub owner_id: UserId,
    pub name: String,
    pub handle: Option<String>,
    pub description: Option<String>,
    pub purpose: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotRecord {
    /// Handle as shown to people: always `@`-prefixed, `None` when unset.
    pub fn display_handle(&self) -> Option<String> {
        self.handle.as_deref().map(display_handle)
    }
}

/// A user together with every bot they own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserWithBots {
    pub profile: UserProfile,
    pub bots: Vec<BotRecord>,
}

impl UserWithBots {
    pub fn id(&self) -> UserId {
        self.profile.id
    }
}

/// Prefix a handle with `@` unless it already has one.
pub fn display_handle(handle: &str) -> String {
    if handle.starts_with('@') {
        handle.to_string()
    } else {
        format!("@{handle}")
    }
}
