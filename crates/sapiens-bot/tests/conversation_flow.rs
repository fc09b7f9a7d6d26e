// End-to-end dialogue tests: real engine and SQLite store, fake chat platform
// and fake text backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use sapiens_bot::app::dispatch;
use sapiens_bot::broadcaster::Broadcaster;
use sapiens_bot::conversation::{BotStep, ConversationEngine, ProfileStep, Step};
use sapiens_bot::scheduler::DailyReportJob;
use sapiens_bot::transport::{
    ChatId, ChatTransport, InboundEvent, InboundUser, MessageId, OutgoingMessage, TextFormat,
    TransportError,
};
use sapiens_core::model::{BotId, BotRecord, UserId, UserProfile, UserWithBots};
use sapiens_core::store::{NewBot, ProfileStore, SqliteStore, StoreError, StoreOutcome};
use sapiens_llm::{GenerationRequest, LlmError, NarrativeGenerator, NarrativeSettings, TextGenerator};

const CHANNEL: ChatId = -1001;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Records every call; sends to the chats in `failing` are rejected.
#[derive(Default)]
struct FakeChat {
    failing: Vec<ChatId>,
    sent: Mutex<Vec<(ChatId, OutgoingMessage)>>,
    edits: Mutex<Vec<(ChatId, MessageId, String)>>,
    answers: Mutex<Vec<Option<String>>>,
}

impl FakeChat {
    fn sent_to(&self, chat_id: ChatId) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(chat, _)| *chat == chat_id)
            .map(|(_, m)| m.clone())
            .collect()
    }

    fn with_buttons(&self) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m)| !m.buttons.is_empty())
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    async fn send_message(
        &self,
        chat_id: ChatId,
        message: &OutgoingMessage,
    ) -> Result<MessageId, TransportError> {
        if self.failing.contains(&chat_id) {
            return Err(TransportError::Api {
                code: 403,
                description: "Forbidden: bot is not a member of the channel chat".into(),
            });
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat_id, message.clone()));
        Ok(sent.len() as MessageId)
    }

    async fn edit_message(
        &self,
        chat_id: ChatId,
        message_id: MessageId,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError> {
        self.edits
            .lock()
            .unwrap()
            .push((chat_id, message_id, message.text.clone()));
        Ok(())
    }

    async fn answer_button(
        &self,
        _callback_id: &str,
        text: Option<&str>,
    ) -> Result<(), TransportError> {
        self.answers.lock().unwrap().push(text.map(str::to_string));
        Ok(())
    }
}

struct EchoGenerator;

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        Ok(format!("Chronicle of the day ({} chars of prompt)", request.prompt.len()))
    }
}

/// In-memory SQLite with injectable faults: the next `fail_*` calls of the
/// matching operation fail, and every user read waits `read_delay`.
struct FlakyStore {
    inner: SqliteStore,
    fail_create_bot: AtomicUsize,
    fail_update: AtomicUsize,
    read_delay: Duration,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: SqliteStore::open(":memory:").unwrap(),
            fail_create_bot: AtomicUsize::new(0),
            fail_update: AtomicUsize::new(0),
            read_delay: Duration::ZERO,
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn injected<T>() -> StoreOutcome<T> {
    StoreOutcome::Failed(StoreError::Database("disk I/O error".into()))
}

#[async_trait]
impl ProfileStore for FlakyStore {
    async fn get_user(&self, id: UserId) -> StoreOutcome<UserProfile> {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        self.inner.get_user(id).await
    }

    async fn create_user(
        &self,
        id: UserId,
        handle: Option<&str>,
        display_name: &str,
    ) -> StoreOutcome<UserProfile> {
        self.inner.create_user(id, handle, display_name).await
    }

    async fn update_profile(
        &self,
        id: UserId,
        bio: Option<&str>,
        interests: Option<&str>,
    ) -> StoreOutcome<UserProfile> {
        if Self::take_failure(&self.fail_update) {
            return injected();
        }
        self.inner.update_profile(id, bio, interests).await
    }

    async fn list_users_with_bots(&self) -> StoreOutcome<Vec<UserWithBots>> {
        self.inner.list_users_with_bots().await
    }

    async fn create_bot(&self, bot: NewBot) -> StoreOutcome<BotRecord> {
        if Self::take_failure(&self.fail_create_bot) {
            return injected();
        }
        self.inner.create_bot(bot).await
    }

    async fn list_bots_by_owner(&self, owner_id: UserId) -> StoreOutcome<Vec<BotRecord>> {
        self.inner.list_bots_by_owner(owner_id).await
    }

    async fn delete_bot(&self, id: BotId) -> bool {
        self.inner.delete_bot(id).await
    }
}

struct Harness {
    store: Arc<dyn ProfileStore>,
    chat: Arc<FakeChat>,
    narrative: Arc<NarrativeGenerator>,
    broadcaster: Arc<Broadcaster>,
    engine: Arc<ConversationEngine>,
}

fn harness(channel: Option<ChatId>) -> Harness {
    harness_with(Arc::new(FlakyStore::new()), FakeChat::default(), channel)
}

fn harness_with(
    store: Arc<dyn ProfileStore>,
    chat: FakeChat,
    channel: Option<ChatId>,
) -> Harness {
    let chat = Arc::new(chat);
    let narrative = Arc::new(NarrativeGenerator::new(
        Arc::new(EchoGenerator),
        NarrativeSettings::default(),
    ));
    let broadcaster = Arc::new(Broadcaster::new(chat.clone(), channel));
    let engine = Arc::new(ConversationEngine::new(
        store.clone(),
        chat.clone(),
        narrative.clone(),
        broadcaster.clone(),
    ));
    Harness {
        store,
        chat,
        narrative,
        broadcaster,
        engine,
    }
}

fn ada() -> InboundUser {
    InboundUser {
        id: 42,
        handle: Some("ada".into()),
        display_name: "Ada L.".into(),
    }
}

fn text(user: &InboundUser, text: &str) -> InboundEvent {
    InboundEvent::Text {
        user: user.clone(),
        chat_id: user.id,
        text: text.into(),
    }
}

fn press(user: &InboundUser, data: &str) -> InboundEvent {
    InboundEvent::Button {
        user: user.clone(),
        chat_id: user.id,
        message_id: Some(7),
        callback_id: "cb-1".into(),
        data: data.into(),
    }
}

async fn say(h: &Harness, user: &InboundUser, input: &str) {
    h.engine.handle_event(text(user, input)).await;
}

/// Runs `/add_bot` and the first three answers of the Aria registration.
async fn register_aria_up_to_purpose(h: &Harness, user: &InboundUser) {
    say(h, user, "/add_bot").await;
    say(h, user, "Aria").await;
    say(h, user, "/skip").await;
    say(h, user, "Watches the skies").await;
}

// ---------------------------------------------------------------------------
// Bot registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registration_commits_once_on_final_answer() {
    let h = harness(Some(CHANNEL));
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    assert_eq!(
        h.engine.current_step(user.id),
        Some(Step::Bot(BotStep::AwaitingPurpose))
    );
    assert_eq!(
        h.store.list_bots_by_owner(user.id).await,
        StoreOutcome::Found(vec![])
    );

    // The final answer arrives twice at the same moment.
    tokio::join!(
        say(&h, &user, "Celestial forecasting"),
        say(&h, &user, "Celestial forecasting"),
    );

    let bots = h.store.list_bots_by_owner(user.id).await.found().unwrap();
    assert_eq!(bots.len(), 1);
    let bot = &bots[0];
    assert_eq!(bot.name, "Aria");
    assert_eq!(bot.handle, None);
    assert_eq!(bot.description.as_deref(), Some("Watches the skies"));
    assert_eq!(bot.purpose.as_deref(), Some("Celestial forecasting"));

    assert_eq!(h.chat.with_buttons().len(), 1, "publish question asked once");
    assert_eq!(
        h.engine.current_step(user.id),
        Some(Step::Bot(BotStep::AwaitingPublishDecision { bot_id: bot.id }))
    );
}

#[tokio::test]
async fn late_duplicate_answer_is_reminded_not_committed() {
    let h = harness(None);
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    say(&h, &user, "Celestial forecasting").await;
    say(&h, &user, "Celestial forecasting").await;

    assert_eq!(h.store.list_bots_by_owner(user.id).await.found().unwrap().len(), 1);
    let last = h.chat.sent_to(user.id).pop().unwrap();
    assert!(last.text.contains("use the buttons"));
}

#[tokio::test]
async fn publishing_posts_chronicle_to_channel_once() {
    let h = harness(Some(CHANNEL));
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    say(&h, &user, "Celestial forecasting").await;
    let bot_id = h.store.list_bots_by_owner(user.id).await.found().unwrap()[0].id;

    h.engine
        .handle_event(press(&user, &format!("publish_yes:{bot_id}")))
        .await;

    let posts = h.chat.sent_to(CHANNEL);
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].format, TextFormat::MarkdownV2);
    assert!(posts[0].text.contains("*Chronicled by:* Ada L\\."));
    assert_eq!(h.engine.current_step(user.id), None);

    let edits = h.chat.edits.lock().unwrap().clone();
    assert!(edits.last().unwrap().2.contains("published"));

    // Pressing again after the decision is a stale choice.
    h.engine
        .handle_event(press(&user, &format!("publish_yes:{bot_id}")))
        .await;
    assert_eq!(h.chat.sent_to(CHANNEL).len(), 1);
    let answers = h.chat.answers.lock().unwrap().clone();
    assert_eq!(answers.last().unwrap().as_deref(), Some("This choice has expired."));
}

#[tokio::test]
async fn publishing_without_channel_still_keeps_the_bot() {
    let h = harness(None);
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    say(&h, &user, "Celestial forecasting").await;
    let bot_id = h.store.list_bots_by_owner(user.id).await.found().unwrap()[0].id;

    h.engine
        .handle_event(press(&user, &format!("publish_yes:{bot_id}")))
        .await;

    let edits = h.chat.edits.lock().unwrap().clone();
    assert!(edits.last().unwrap().2.contains("channel is not configured"));
    assert_eq!(h.store.list_bots_by_owner(user.id).await.found().unwrap().len(), 1);
}

#[tokio::test]
async fn declining_ends_dialogue_without_posting() {
    let h = harness(Some(CHANNEL));
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    say(&h, &user, "Celestial forecasting").await;
    let bot_id = h.store.list_bots_by_owner(user.id).await.found().unwrap()[0].id;

    h.engine
        .handle_event(press(&user, &format!("publish_no:{bot_id}")))
        .await;

    assert!(h.chat.sent_to(CHANNEL).is_empty());
    assert_eq!(h.engine.current_step(user.id), None);
}

#[tokio::test]
async fn cancel_discards_the_draft() {
    let h = harness(None);
    let user = ada();

    say(&h, &user, "/add_bot").await;
    say(&h, &user, "Aria").await;
    say(&h, &user, "/cancel").await;

    assert_eq!(h.engine.current_step(user.id), None);
    assert_eq!(
        h.store.list_bots_by_owner(user.id).await,
        StoreOutcome::Found(vec![])
    );
}

#[tokio::test]
async fn failed_bot_save_returns_to_purpose_and_keeps_draft() {
    let store = Arc::new(FlakyStore::new());
    store.fail_create_bot.store(1, Ordering::SeqCst);
    let h = harness_with(store, FakeChat::default(), None);
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    say(&h, &user, "Celestial forecasting").await;

    assert_eq!(
        h.engine.current_step(user.id),
        Some(Step::Bot(BotStep::AwaitingPurpose))
    );
    let last = h.chat.sent_to(user.id).pop().unwrap();
    assert!(last.text.contains("Your bot could not be saved right now"));
    assert_eq!(
        h.store.list_bots_by_owner(user.id).await,
        StoreOutcome::Found(vec![])
    );
    assert!(h.chat.with_buttons().is_empty());

    // Only the purpose is asked again; earlier answers survive.
    say(&h, &user, "Celestial forecasting").await;

    let bots = h.store.list_bots_by_owner(user.id).await.found().unwrap();
    assert_eq!(bots.len(), 1);
    assert_eq!(bots[0].name, "Aria");
    assert_eq!(bots[0].description.as_deref(), Some("Watches the skies"));
    assert_eq!(h.chat.with_buttons().len(), 1);
}

#[tokio::test]
async fn failed_chronicle_post_still_keeps_the_bot() {
    let chat = FakeChat {
        failing: vec![CHANNEL],
        ..Default::default()
    };
    let h = harness_with(Arc::new(FlakyStore::new()), chat, Some(CHANNEL));
    let user = ada();

    register_aria_up_to_purpose(&h, &user).await;
    say(&h, &user, "Celestial forecasting").await;
    let bot_id = h.store.list_bots_by_owner(user.id).await.found().unwrap()[0].id;

    h.engine
        .handle_event(press(&user, &format!("publish_yes:{bot_id}")))
        .await;

    assert!(h.chat.sent_to(CHANNEL).is_empty());
    let edits = h.chat.edits.lock().unwrap().clone();
    assert!(edits
        .last()
        .unwrap()
        .2
        .contains("could not be published to the channel"));
    assert_eq!(h.engine.current_step(user.id), None);
    assert_eq!(h.store.list_bots_by_owner(user.id).await.found().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn dispatch_keeps_one_users_events_in_order() {
    let store = Arc::new(FlakyStore {
        read_delay: Duration::from_millis(200),
        ..FlakyStore::new()
    });
    let h = harness_with(store, FakeChat::default(), None);
    let user = ada();

    let (tx, rx) = mpsc::channel(8);
    for input in ["/add_bot", "Aria", "/skip"] {
        tx.send(text(&user, input)).await.unwrap();
    }
    drop(tx);

    let (_stop_tx, stop_rx) = watch::channel(false);
    dispatch(rx, Arc::clone(&h.engine), stop_rx).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    // "/add_bot" stalls on the user lookup; the answers must wait for it.
    assert_eq!(
        h.engine.current_step(user.id),
        Some(Step::Bot(BotStep::AwaitingDescription))
    );
    let replies = h.chat.sent_to(user.id);
    assert_eq!(replies.len(), 3);
    assert!(replies.iter().all(|m| !m.text.contains("/help")));
}

// ---------------------------------------------------------------------------
// Profile and commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn profile_dialogue_saves_both_fields() {
    let h = harness(None);
    let user = ada();

    say(&h, &user, "/profile").await;
    say(&h, &user, "I write engines").await;
    assert_eq!(
        h.engine.current_step(user.id),
        Some(Step::Profile(ProfileStep::AwaitingInterests))
    );
    say(&h, &user, "Analytical machines").await;

    let profile = h.store.get_user(user.id).await.found().unwrap();
    assert_eq!(profile.bio.as_deref(), Some("I write engines"));
    assert_eq!(profile.interests.as_deref(), Some("Analytical machines"));
    assert_eq!(profile.display_name, "Ada L.");
    assert_eq!(h.engine.current_step(user.id), None);
}

#[tokio::test]
async fn failed_profile_save_asks_for_interests_again() {
    let store = Arc::new(FlakyStore::new());
    store.fail_update.store(1, Ordering::SeqCst);
    let h = harness_with(store, FakeChat::default(), None);
    let user = ada();

    say(&h, &user, "/profile").await;
    say(&h, &user, "I write engines").await;
    say(&h, &user, "Analytical machines").await;

    assert_eq!(
        h.engine.current_step(user.id),
        Some(Step::Profile(ProfileStep::AwaitingInterests))
    );
    let last = h.chat.sent_to(user.id).pop().unwrap();
    assert!(last.text.contains("Your profile could not be saved right now"));
    assert_eq!(h.store.get_user(user.id).await.found().unwrap().bio, None);

    say(&h, &user, "Analytical machines").await;

    let profile = h.store.get_user(user.id).await.found().unwrap();
    assert_eq!(profile.bio.as_deref(), Some("I write engines"));
    assert_eq!(profile.interests.as_deref(), Some("Analytical machines"));
    assert_eq!(h.engine.current_step(user.id), None);
}

#[tokio::test]
async fn start_registers_then_welcomes_back() {
    let h = harness(None);
    let user = ada();

    say(&h, &user, "/start").await;
    say(&h, &user, "/start").await;

    let replies = h.chat.sent_to(user.id);
    assert!(replies[0].text.contains("Let's begin"));
    assert!(replies[1].text.contains("Welcome back, Ada L."));
    assert!(h.store.get_user(user.id).await.is_found());
}

#[tokio::test]
async fn delete_bot_only_touches_own_bots() {
    let h = harness(None);
    let owner = ada();
    let other = InboundUser {
        id: 77,
        handle: None,
        display_name: "Grace".into(),
    };

    register_aria_up_to_purpose(&h, &owner).await;
    say(&h, &owner, "Celestial forecasting").await;
    let bot_id = h.store.list_bots_by_owner(owner.id).await.found().unwrap()[0].id;

    say(&h, &other, "/start").await;
    say(&h, &other, &format!("/delete_bot {bot_id}")).await;
    assert_eq!(h.store.list_bots_by_owner(owner.id).await.found().unwrap().len(), 1);

    say(&h, &owner, &format!("/delete_bot {bot_id}")).await;
    assert!(h.store.list_bots_by_owner(owner.id).await.found().unwrap().is_empty());
    // The pending publish decision went with the bot.
    assert_eq!(h.engine.current_step(owner.id), None);
}

#[tokio::test]
async fn idle_text_gets_a_hint() {
    let h = harness(None);
    let user = ada();

    say(&h, &user, "hello?").await;

    let replies = h.chat.sent_to(user.id);
    assert_eq!(replies.len(), 1);
    assert!(replies[0].text.contains("/help"));
}

// ---------------------------------------------------------------------------
// Daily report
// ---------------------------------------------------------------------------

#[tokio::test]
async fn daily_report_reaches_every_user() {
    let h = harness(None);
    for id in [1, 2, 3] {
        h.store.create_user(id, None, "Someone").await;
    }

    let job = DailyReportJob::new(h.store.clone(), h.narrative.clone(), h.broadcaster.clone());
    let report = job.run_once().await.unwrap();

    assert_eq!((report.sent, report.failed), (3, 0));
    for id in [1, 2, 3] {
        let messages = h.chat.sent_to(id);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].text.starts_with("\u{1F9EC} *Daily Species Report*"));
    }
}

#[tokio::test]
async fn daily_report_skips_empty_store() {
    let h = harness(None);
    let job = DailyReportJob::new(h.store.clone(), h.narrative.clone(), h.broadcaster.clone());

    assert!(job.run_once().await.is_none());
    assert!(h.chat.sent.lock().unwrap().is_empty());
}
