// Local primary with a best-effort remote copy of new users and bots.

use async_trait::async_trait;
use tracing::{info, warn};

use super::{ApiStore, NewBot, ProfileStore, SqliteStore, StoreOutcome};
use crate::model::{BotId, BotRecord, UserId, UserProfile, UserWithBots};

/// Answers from the primary store. Successful user and bot creations are
/// repeated on the mirror; mirror failures are logged and dropped.
pub struct MirroredStore<P = SqliteStore, M = ApiStore> {
    primary: P,
    mirror: M,
}

impl<P, M> MirroredStore<P, M> {
    pub fn new(primary: P, mirror: M) -> Self {
        Self { primary, mirror }
    }
}

#[async_trait]
impl<P, M> ProfileStore for MirroredStore<P, M>
where
    P: ProfileStore,
    M: ProfileStore,
{
    async fn get_user(&self, id: UserId) -> StoreOutcome<UserProfile> {
        self.primary.get_user(id).await
    }

    async fn create_user(
        &self,
        id: UserId,
        handle: Option<&str>,
        display_name: &str,
    ) -> StoreOutcome<UserProfile> {
        let outcome = self.primary.create_user(id, handle, display_name).await;
        if outcome.is_found() {
            match self.mirror.create_user(id, handle, display_name).await {
                StoreOutcome::Found(_) => info!("Mirrored user {id}"),
                StoreOutcome::NotFound => warn!("Mirror did not accept user {id}"),
                StoreOutcome::Failed(err) => warn!("Failed to mirror user {id}: {err}"),
            }
        }
        outcome
    }

    async fn update_profile(
        &self,
        id: UserId,
        bio: Option<&str>,
        interests: Option<&str>,
    ) -> StoreOutcome<UserProfile> {
        self.primary.update_profile(id, bio, interests).await
    }

    async fn list_users_with_bots(&self) -> StoreOutcome<Vec<UserWithBots>> {
        self.primary.list_users_with_bots().await
    }

    async fn create_bot(&self, bot: NewBot) -> StoreOutcome<BotRecord> {
        let outcome = self.primary.create_bot(bot.clone()).await;
        if outcome.is_found() {
            let owner_id = bot.owner_id;
            let name = bot.name.clone();
            match self.mirror.create_bot(bot).await {
                StoreOutcome::Found(_) => info!("Mirrored bot {name} of user {owner_id}"),
                StoreOutcome::NotFound => warn!("Mirror did not accept bot {name}"),
                StoreOutcome::Failed(err) => warn!("Failed to mirror bot {name}: {err}"),
            }
        }
        outcome
    }

    async fn list_bots_by_owner(&self, owner_id: UserId) -> StoreOutcome<Vec<BotRecord>> {
        self.primary.list_bots_by_owner(owner_id).await
    }

    async fn delete_bot(&self, id: BotId) -> bool {
        self.primary.delete_bot(id).await
    }
}
