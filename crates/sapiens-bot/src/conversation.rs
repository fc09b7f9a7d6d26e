// Conversation engine: commands, the two multi-step dialogues, and the
// publish decision that follows a bot registration.
//
// Dialogue state lives in a `std::sync::Mutex<HashMap<..>>`. The lock is
// only taken inside short synchronous blocks and never held across an await,
// so events of different users interleave freely.
//
// The terminal step of each dialogue commits in two phases: the step moves to
// `Committing` under the lock, the store call runs without it, then the step
// moves on (or back, on failure). A duplicate event for the terminal step
// sees `Committing` or the decision step and does not commit again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use sapiens_core::model::{display_handle, BotId, UserId};
use sapiens_core::store::{NewBot, ProfileStore, StoreOutcome};
use sapiens_llm::NarrativeGenerator;

use crate::broadcaster::Broadcaster;
use crate::transport::{
    Button, ChatId, ChatTransport, InboundEvent, InboundUser, MessageId, OutgoingMessage,
    MAX_MESSAGE_CHARS,
};

// ---------------------------------------------------------------------------
// Draft field names
// ---------------------------------------------------------------------------

pub const FIELD_BIO: &str = "bio";
pub const FIELD_INTERESTS: &str = "interests";
pub const FIELD_BOT_NAME: &str = "bot_name";
pub const FIELD_BOT_USERNAME: &str = "bot_username";
pub const FIELD_BOT_DESCRIPTION: &str = "bot_description";
pub const FIELD_BOT_PURPOSE: &str = "bot_purpose";

const SKIP_TOKEN: &str = "/skip";
const PUBLISH_YES: &str = "publish_yes";
const PUBLISH_NO: &str = "publish_no";

// ---------------------------------------------------------------------------
// User-facing texts
// ---------------------------------------------------------------------------

const HELP: &str = "\u{1F9EC} boto-sapiens studies the ecosystem of Telegram bots.\n\n\
    \u{1F4CB} Commands:\n\n\
    /start - Get started\n\
    /profile - Update your profile\n\
    /add_bot - Register a bot\n\
    /my_bots - List your bots\n\
    /delete_bot <id> - Remove one of your bots\n\
    /cancel - Abort the current dialogue\n\
    /help - This help\n\n\
    \u{1F4A1} Every day I write an AI-generated Species Report on the state of our bot ecosystem!";

const WELCOME_NEW: &str = "\u{1F44B} Hi! I am boto-sapiens, a bot that studies the ecosystem of Telegram bots.\n\n\
    \u{1F9EC} I collect information about you and your bots to write daily reports \
    on the state of our digital ecosystem.\n\n\
    Let's begin! Tell me a little about yourself:\n\
    /profile - Fill in your profile\n\
    /add_bot - Tell me about your bot";

const ASK_BIO: &str = "\u{1F4DD} Let's update your profile!\n\n\
    Tell me about yourself (bio). Who are you, what do you do?";
const ASK_INTERESTS: &str = "\u{1F44D} Great!\n\n\
    Now tell me about your interests. What draws you to bots and technology?";
const PROFILE_SAVED: &str = "\u{2705} Profile updated!\n\n\
    Now you can tell me about your bots:\n\
    /add_bot - Register a bot";
const PROFILE_SAVE_FAILED: &str = "\u{26A0}\u{FE0F} Your profile could not be saved right now.\n\
    Send your interests again to retry, or /cancel to stop.";

const ASK_BOT_NAME: &str = "\u{1F916} Let's register your bot!\n\n\
    What is your bot called?";
const ASK_BOT_HANDLE: &str = "\u{1F44D} Great!\n\n\
    What is your bot's username? (for example @mybot, or send /skip)";
const ASK_BOT_DESCRIPTION: &str = "Describe your bot. What does it do?";
const ASK_BOT_PURPOSE: &str = "Last question: what is your bot's purpose? Why did you create it?";
const BOT_SAVE_FAILED: &str = "\u{26A0}\u{FE0F} Your bot could not be saved right now.\n\
    Send the purpose again to retry, or /cancel to stop.";

const BOT_SAVED: &str = "\u{2705} Bot successfully added!\n\n\
    A new species has been registered.";
const ASK_PUBLISH: &str = "\u{2705} Bot successfully added!\n\n\
    A new species has been registered.\n\
    Do you want to publish its Chronicle to the Boto Sapiens channel?";
const GENERATING: &str = "\u{2705} Bot successfully added!\n\n\
    \u{1F52E} Generating chronicle... The Chronicler is observing the new species...";
const NEXT_STEPS: &str = "You can add more bots: /add_bot\nOr view your bots: /my_bots";
const USE_BUTTONS: &str = "Please use the buttons above to choose whether to publish the Chronicle.";
const CHOICE_EXPIRED: &str = "This choice has expired.";

const IDLE_HINT: &str = "I did not understand that. Send /help to see what I can do.";
const STORE_UNAVAILABLE: &str = "\u{26A0}\u{FE0F} The archive is unavailable right now. Please try again later.";

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Profile,
    AddBot,
    MyBots,
    DeleteBot(Option<String>),
    Cancel,
    Help,
    Unknown(String),
}

impl Command {
    /// Parse a slash command. Returns `None` for ordinary text and for
    /// `/skip`, which is step input rather than a command.
    pub fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (token, arg) = match rest.split_once(char::is_whitespace) {
            Some((token, arg)) => (token, Some(arg.trim()).filter(|a| !a.is_empty())),
            None => (rest, None),
        };
        // "/cmd@botname" in group chats.
        let name = token.split('@').next().unwrap_or(token).to_lowercase();

        let command = match name.as_str() {
            "skip" => return None,
            "start" => Command::Start,
            "profile" => Command::Profile,
            "add_bot" => Command::AddBot,
            "my_bots" => Command::MyBots,
            "delete_bot" => Command::DeleteBot(arg.map(str::to_string)),
            "cancel" => Command::Cancel,
            "help" => Command::Help,
            _ => Command::Unknown(name),
        };
        Some(command)
    }
}

// ---------------------------------------------------------------------------
// Publish buttons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishChoice {
    Publish,
    Decline,
}

pub fn publish_buttons(bot_id: BotId) -> Vec<Button> {
    vec![
        Button::new("\u{2705} Yes", format!("{PUBLISH_YES}:{bot_id}")),
        Button::new("\u{274C} No", format!("{PUBLISH_NO}:{bot_id}")),
    ]
}

pub fn parse_publish_button(data: &str) -> Option<(PublishChoice, BotId)> {
    let (kind, id) = data.split_once(':')?;
    let choice = match kind {
        PUBLISH_YES => PublishChoice::Publish,
        PUBLISH_NO => PublishChoice::Decline,
        _ => return None,
    };
    Some((choice, id.trim().parse().ok()?))
}

// ---------------------------------------------------------------------------
// Dialogue state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileStep {
    AwaitingBio,
    AwaitingInterests,
    Committing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotStep {
    AwaitingName,
    AwaitingHandle,
    AwaitingDescription,
    AwaitingPurpose,
    Committing,
    AwaitingPublishDecision { bot_id: BotId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Profile(ProfileStep),
    Bot(BotStep),
}

/// One user's in-progress dialogue. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    pub step: Step,
    pub draft: HashMap<String, String>,
}

/// What the engine must do after a step accepted input.
#[derive(Debug, Clone, PartialEq)]
enum StepAction {
    Prompt(&'static str),
    CommitProfile {
        bio: Option<String>,
        interests: String,
    },
    CommitBot(HashMap<String, String>),
    RemindButtons,
    /// A commit for this dialogue is already running.
    InFlight,
}

impl ConversationState {
    pub fn profile_update() -> Self {
        Self {
            step: Step::Profile(ProfileStep::AwaitingBio),
            draft: HashMap::new(),
        }
    }

    pub fn bot_registration() -> Self {
        Self {
            step: Step::Bot(BotStep::AwaitingName),
            draft: HashMap::new(),
        }
    }

    fn put(&mut self, field: &str, value: &str) {
        self.draft.insert(field.to_string(), value.trim().to_string());
    }

    /// Store `input` for the current step and advance.
    fn accept(&mut self, input: &str) -> StepAction {
        match self.step {
            Step::Profile(ProfileStep::AwaitingBio) => {
                self.put(FIELD_BIO, input);
                self.step = Step::Profile(ProfileStep::AwaitingInterests);
                StepAction::Prompt(ASK_INTERESTS)
            }
            Step::Profile(ProfileStep::AwaitingInterests) => {
                self.put(FIELD_INTERESTS, input);
                self.step = Step::Profile(ProfileStep::Committing);
                StepAction::CommitProfile {
                    bio: self.draft.get(FIELD_BIO).cloned(),
                    interests: input.trim().to_string(),
                }
            }
            Step::Profile(ProfileStep::Committing) | Step::Bot(BotStep::Committing) => {
                StepAction::InFlight
            }
            Step::Bot(BotStep::AwaitingName) => {
                self.put(FIELD_BOT_NAME, input);
                self.step = Step::Bot(BotStep::AwaitingHandle);
                StepAction::Prompt(ASK_BOT_HANDLE)
            }
            Step::Bot(BotStep::AwaitingHandle) => {
                if input.trim() == SKIP_TOKEN {
                    self.draft.remove(FIELD_BOT_USERNAME);
                } else {
                    self.put(FIELD_BOT_USERNAME, input);
                }
                self.step = Step::Bot(BotStep::AwaitingDescription);
                StepAction::Prompt(ASK_BOT_DESCRIPTION)
            }
            Step::Bot(BotStep::AwaitingDescription) => {
                self.put(FIELD_BOT_DESCRIPTION, input);
                self.step = Step::Bot(BotStep::AwaitingPurpose);
                StepAction::Prompt(ASK_BOT_PURPOSE)
            }
            Step::Bot(BotStep::AwaitingPurpose) => {
                self.put(FIELD_BOT_PURPOSE, input);
                self.step = Step::Bot(BotStep::Committing);
                StepAction::CommitBot(self.draft.clone())
            }
            Step::Bot(BotStep::AwaitingPublishDecision { .. }) => StepAction::RemindButtons,
        }
    }
}

fn new_bot_from_draft(owner_id: UserId, draft: &HashMap<String, String>) -> NewBot {
    let field = |name: &str| draft.get(name).filter(|v| !v.is_empty()).cloned();
    NewBot {
        owner_id,
        name: field(FIELD_BOT_NAME).unwrap_or_default(),
        handle: field(FIELD_BOT_USERNAME),
        description: field(FIELD_BOT_DESCRIPTION),
        purpose: field(FIELD_BOT_PURPOSE),
    }
}

fn display_name(user: &InboundUser) -> &str {
    if user.display_name.trim().is_empty() {
        "User"
    } else {
        &user.display_name
    }
}

fn creator_name(user: &InboundUser) -> String {
    if !user.display_name.trim().is_empty() {
        user.display_name.clone()
    } else if let Some(handle) = &user.handle {
        display_handle(handle)
    } else {
        "Anonymous".to_string()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ConversationEngine {
    store: Arc<dyn ProfileStore>,
    transport: Arc<dyn ChatTransport>,
    narrative: Arc<NarrativeGenerator>,
    broadcaster: Arc<Broadcaster>,
    states: Mutex<HashMap<UserId, ConversationState>>,
}

impl ConversationEngine {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        transport: Arc<dyn ChatTransport>,
        narrative: Arc<NarrativeGenerator>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            store,
            transport,
            narrative,
            broadcaster,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current dialogue step of `user_id`, if a dialogue is active.
    pub fn current_step(&self, user_id: UserId) -> Option<Step> {
        self.states().get(&user_id).map(|s| s.step)
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Text {
                user,
                chat_id,
                text,
            } => self.handle_text(&user, chat_id, &text).await,
            InboundEvent::Button {
                user,
                chat_id,
                message_id,
                callback_id,
                data,
            } => {
                self.handle_button(&user, chat_id, message_id, &callback_id, &data)
                    .await
            }
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<UserId, ConversationState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `user_id` from `expected` to `next` (or end the dialogue when
    /// `next` is `None`). Does nothing if the dialogue has moved on since.
    fn transition(&self, user_id: UserId, expected: Step, next: Option<Step>) -> bool {
        let mut states = self.states();
        if !states.get(&user_id).is_some_and(|s| s.step == expected) {
            return false;
        }
        match next {
            Some(step) => {
                if let Some(state) = states.get_mut(&user_id) {
                    state.step = step;
                }
            }
            None => {
                states.remove(&user_id);
            }
        }
        true
    }

    async fn send(&self, chat_id: ChatId, message: OutgoingMessage) {
        for part in message.split(MAX_MESSAGE_CHARS) {
            if let Err(e) = self.transport.send_message(chat_id, &part).await {
                warn!("Failed to send message to chat {chat_id}: {e}");
                return;
            }
        }
    }

    async fn reply(&self, chat_id: ChatId, text: impl Into<String>) {
        self.send(chat_id, OutgoingMessage::plain(text)).await;
    }

    /// Edit the button message in place when possible, otherwise send anew.
    async fn edit_or_send(&self, chat_id: ChatId, message_id: Option<MessageId>, text: &str) {
        let message = OutgoingMessage::plain(text);
        if let Some(message_id) = message_id {
            match self
                .transport
                .edit_message(chat_id, message_id, &message)
                .await
            {
                Ok(()) => return,
                Err(e) => debug!("Edit of message {message_id} failed, sending instead: {e}"),
            }
        }
        self.send(chat_id, message).await;
    }

    // -- Text ---------------------------------------------------------------

    async fn handle_text(&self, user: &InboundUser, chat_id: ChatId, text: &str) {
        if let Some(command) = Command::parse(text) {
            self.handle_command(command, user, chat_id).await;
            return;
        }

        let action = {
            let mut states = self.states();
            states.get_mut(&user.id).map(|state| state.accept(text))
        };

        match action {
            None => self.reply(chat_id, IDLE_HINT).await,
            Some(StepAction::Prompt(prompt)) => self.reply(chat_id, prompt).await,
            Some(StepAction::RemindButtons) => self.reply(chat_id, USE_BUTTONS).await,
            Some(StepAction::InFlight) => {
                debug!("Ignoring input from user {} while a commit is in flight", user.id)
            }
            Some(StepAction::CommitProfile { bio, interests }) => {
                self.commit_profile(user, chat_id, bio, interests).await
            }
            Some(StepAction::CommitBot(draft)) => self.commit_bot(user, chat_id, draft).await,
        }
    }

    async fn commit_profile(
        &self,
        user: &InboundUser,
        chat_id: ChatId,
        bio: Option<String>,
        interests: String,
    ) {
        let committing = Step::Profile(ProfileStep::Committing);
        match self
            .store
            .update_profile(user.id, bio.as_deref(), Some(&interests))
            .await
        {
            StoreOutcome::Found(_) => {
                self.transition(user.id, committing, None);
                info!("Profile of user {} updated", user.id);
                self.reply(chat_id, PROFILE_SAVED).await;
            }
            StoreOutcome::NotFound | StoreOutcome::Failed(_) => {
                self.transition(
                    user.id,
                    committing,
                    Some(Step::Profile(ProfileStep::AwaitingInterests)),
                );
                self.reply(chat_id, PROFILE_SAVE_FAILED).await;
            }
        }
    }

    async fn commit_bot(
        &self,
        user: &InboundUser,
        chat_id: ChatId,
        draft: HashMap<String, String>,
    ) {
        let committing = Step::Bot(BotStep::Committing);
        let new_bot = new_bot_from_draft(user.id, &draft);

        match self.store.create_bot(new_bot).await {
            StoreOutcome::Found(record) => {
                let awaiting = Step::Bot(BotStep::AwaitingPublishDecision { bot_id: record.id });
                if self.transition(user.id, committing, Some(awaiting)) {
                    self.send(
                        chat_id,
                        OutgoingMessage::plain(ASK_PUBLISH).with_buttons(publish_buttons(record.id)),
                    )
                    .await;
                } else {
                    // Dialogue was cancelled or restarted meanwhile.
                    self.reply(chat_id, format!("{BOT_SAVED}\n\n{NEXT_STEPS}")).await;
                }
            }
            StoreOutcome::NotFound | StoreOutcome::Failed(_) => {
                self.transition(user.id, committing, Some(Step::Bot(BotStep::AwaitingPurpose)));
                self.reply(chat_id, BOT_SAVE_FAILED).await;
            }
        }
    }

    // -- Commands -----------------------------------------------------------

    async fn handle_command(&self, command: Command, user: &InboundUser, chat_id: ChatId) {
        debug!("User {} sent {:?}", user.id, command);
        match command {
            Command::Start => self.cmd_start(user, chat_id).await,
            Command::Profile => {
                self.enter_dialogue(user, chat_id, ConversationState::profile_update(), ASK_BIO)
                    .await
            }
            Command::AddBot => {
                self.enter_dialogue(
                    user,
                    chat_id,
                    ConversationState::bot_registration(),
                    ASK_BOT_NAME,
                )
                .await
            }
            Command::MyBots => self.cmd_my_bots(user, chat_id).await,
            Command::DeleteBot(arg) => self.cmd_delete_bot(user, chat_id, arg.as_deref()).await,
            Command::Cancel => {
                let removed = self.states().remove(&user.id).is_some();
                let text = if removed {
                    "Cancelled. Nothing was saved from this dialogue."
                } else {
                    "There is nothing to cancel."
                };
                self.reply(chat_id, text).await;
            }
            Command::Help => self.reply(chat_id, HELP).await,
            Command::Unknown(name) => {
                self.reply(chat_id, format!("Unknown command /{name}. Send /help for the list."))
                    .await
            }
        }
    }

    async fn cmd_start(&self, user: &InboundUser, chat_id: ChatId) {
        let existing = self.store.get_user(user.id).await;
        let synced = self
            .store
            .create_user(user.id, user.handle.as_deref(), display_name(user))
            .await;

        match (existing, synced.is_found()) {
            (StoreOutcome::Found(profile), _) => {
                self.reply(
                    chat_id,
                    format!(
                        "\u{1F44B} Welcome back, {}!\n\n\
                         Commands:\n\
                         /profile - Update your profile\n\
                         /add_bot - Register a bot\n\
                         /my_bots - List your bots\n\
                         /help - Help",
                        profile.display_name
                    ),
                )
                .await
            }
            (_, true) => self.reply(chat_id, WELCOME_NEW).await,
            (_, false) => self.reply(chat_id, STORE_UNAVAILABLE).await,
        }
    }

    /// Make sure a user row exists so bot rows always have an owner.
    async fn ensure_user(&self, user: &InboundUser) -> bool {
        match self.store.get_user(user.id).await {
            StoreOutcome::Found(_) => true,
            StoreOutcome::NotFound => self
                .store
                .create_user(user.id, user.handle.as_deref(), display_name(user))
                .await
                .is_found(),
            StoreOutcome::Failed(_) => false,
        }
    }

    async fn enter_dialogue(
        &self,
        user: &InboundUser,
        chat_id: ChatId,
        state: ConversationState,
        prompt: &'static str,
    ) {
        if !self.ensure_user(user).await {
            self.reply(chat_id, STORE_UNAVAILABLE).await;
            return;
        }
        // Last writer wins: any earlier dialogue is discarded.
        self.states().insert(user.id, state);
        self.reply(chat_id, prompt).await;
    }

    async fn cmd_my_bots(&self, user: &InboundUser, chat_id: ChatId) {
        let bots = match self.store.list_bots_by_owner(user.id).await {
            StoreOutcome::Found(bots) => bots,
            StoreOutcome::NotFound => Vec::new(),
            StoreOutcome::Failed(_) => {
                self.reply(chat_id, STORE_UNAVAILABLE).await;
                return;
            }
        };

        if bots.is_empty() {
            self.reply(
                chat_id,
                "You have not registered any bots yet.\n\nAdd your first: /add_bot",
            )
            .await;
            return;
        }

        let mut text = String::from("\u{1F916} Your bots:\n\n");
        for (i, bot) in bots.iter().enumerate() {
            text.push_str(&format!("{}. {}", i + 1, bot.name));
            if let Some(handle) = bot.display_handle() {
                text.push_str(&format!(" ({handle})"));
            }
            text.push_str(&format!(" [#{}]\n", bot.id));
            text.push_str(&format!(
                "   \u{1F4DD} {}\n",
                bot.description.as_deref().unwrap_or("No description")
            ));
            text.push_str(&format!(
                "   \u{1F3AF} Purpose: {}\n\n",
                bot.purpose.as_deref().unwrap_or("No purpose specified")
            ));
        }
        text.push_str("Remove one with /delete_bot <id>");
        self.reply(chat_id, text).await;
    }

    async fn cmd_delete_bot(&self, user: &InboundUser, chat_id: ChatId, arg: Option<&str>) {
        let Some(bot_id) = arg.and_then(|a| a.trim_start_matches('#').parse::<BotId>().ok())
        else {
            self.reply(chat_id, "Usage: /delete_bot <id> (see /my_bots for ids)")
                .await;
            return;
        };

        let owned = match self.store.list_bots_by_owner(user.id).await {
            StoreOutcome::Found(bots) => bots.iter().any(|b| b.id == bot_id),
            StoreOutcome::NotFound => false,
            StoreOutcome::Failed(_) => {
                self.reply(chat_id, STORE_UNAVAILABLE).await;
                return;
            }
        };
        if !owned {
            self.reply(chat_id, format!("No bot #{bot_id} among your bots."))
                .await;
            return;
        }

        if self.store.delete_bot(bot_id).await {
            // A pending publish decision for this bot is void now.
            self.transition(
                user.id,
                Step::Bot(BotStep::AwaitingPublishDecision { bot_id }),
                None,
            );
            info!("User {} deleted bot #{bot_id}", user.id);
            self.reply(chat_id, format!("\u{1F5D1} Bot #{bot_id} removed from the archive."))
                .await;
        } else {
            self.reply(chat_id, STORE_UNAVAILABLE).await;
        }
    }

    // -- Buttons ------------------------------------------------------------

    async fn handle_button(
        &self,
        user: &InboundUser,
        chat_id: ChatId,
        message_id: Option<MessageId>,
        callback_id: &str,
        data: &str,
    ) {
        let pending = parse_publish_button(data).and_then(|(choice, bot_id)| {
            let mut states = self.states();
            let expected = Step::Bot(BotStep::AwaitingPublishDecision { bot_id });
            if states.get(&user.id).is_some_and(|s| s.step == expected) {
                states.remove(&user.id).map(|state| (choice, state.draft))
            } else {
                None
            }
        });

        let Some((choice, draft)) = pending else {
            debug!("Stale button {data:?} from user {}", user.id);
            if let Err(e) = self
                .transport
                .answer_button(callback_id, Some(CHOICE_EXPIRED))
                .await
            {
                warn!("Failed to answer button: {e}");
            }
            return;
        };

        if let Err(e) = self.transport.answer_button(callback_id, None).await {
            warn!("Failed to answer button: {e}");
        }

        let bot_name = draft.get(FIELD_BOT_NAME).map(String::as_str).unwrap_or_default();
        match choice {
            PublishChoice::Decline => {
                info!("User {} declined to publish chronicle for {bot_name}", user.id);
                self.edit_or_send(
                    chat_id,
                    message_id,
                    &format!(
                        "\u{2705} Bot successfully added!\n\n\
                         Alright. The Chronicle will remain in the archives for now.\n\n{NEXT_STEPS}"
                    ),
                )
                .await;
            }
            PublishChoice::Publish => {
                info!("User {} chose to publish chronicle for {bot_name}", user.id);
                self.edit_or_send(chat_id, message_id, GENERATING).await;

                let chronicle = self
                    .narrative
                    .generate_chronicle(
                        bot_name,
                        draft.get(FIELD_BOT_USERNAME).map(String::as_str),
                        draft
                            .get(FIELD_BOT_DESCRIPTION)
                            .map(String::as_str)
                            .unwrap_or_default(),
                        draft
                            .get(FIELD_BOT_PURPOSE)
                            .map(String::as_str)
                            .unwrap_or_default(),
                    )
                    .await;

                let outcome = if !self.broadcaster.channel_configured() {
                    "\u{1F4DC} Chronicle generated, but the channel is not configured."
                } else if self
                    .broadcaster
                    .publish_chronicle(&chronicle, &creator_name(user))
                    .await
                {
                    "\u{1F4DC} The Chronicle has been written and published to the archives."
                } else {
                    "\u{1F4DC} The Chronicle was generated but could not be published to the channel.\n\
                     The bot is saved in the archive."
                };

                self.edit_or_send(
                    chat_id,
                    message_id,
                    &format!("\u{2705} Bot successfully added!\n\n{outcome}\n\n{NEXT_STEPS}"),
                )
                .await;
            }
        }
    }
}
