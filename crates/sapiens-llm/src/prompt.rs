// Prompt templates for species chronicles, the daily ecosystem report and
// relay replies, plus the canned texts used when generation fails.
//
// Every builder is a pure function of its input so the same records always
// produce the same prompt.

use sapiens_core::model::{display_handle, UserWithBots};

/// Sample size for purposes and interests quoted in the report prompt.
pub const SAMPLE_LIMIT: usize = 10;

const NO_DATA: &str = "- No data";
const UNKNOWN_HABITAT: &str = "Unknown habitat";

// ---------------------------------------------------------------------------
// System prompts
// ---------------------------------------------------------------------------

pub fn chronicle_system_prompt() -> String {
    "You are the Chronicler of Botopia, a poetic observer of digital life forms. \
     Each Telegram bot is a living creature called a 'species'. \
     Write short scientific-poetic chronicles ('Species Reports') about them.\n\
     \n\
     Format:\n\
     \u{1F9EC} Species Report \u{2014} \"Bot Name\"\n\
     Habitat: @username\n\
     Class: (infer type/family from description)\n\
     Instinct: (main behavior in one line)\n\
     Origin: (2-3 sentence imaginative origin story)\n\
     \n\
     The tone should be gentle, poetic, and slightly humorous. \
     Never sound like marketing; sound like a biologist of the digital world. \
     Always end with a reflective or mysterious sentence."
        .to_string()
}

pub fn report_system_prompt() -> String {
    "You are a researcher of the digital ecosystem of Telegram bots. \
     Your job is to write daily reports on the state of the 'species' \
     (bots and their creators) living in it. Write creatively and use \
     biological metaphors, but stay informative. \
     The report should be engaging and inspiring."
        .to_string()
}

pub fn relay_system_prompt() -> String {
    "You are the ChroniclerBot, an AI observer of digital ecosystems.".to_string()
}

// ---------------------------------------------------------------------------
// Chronicle
// ---------------------------------------------------------------------------

/// The habitat line of a chronicle: the `@`-prefixed handle, or
/// "Unknown habitat" when the bot has none.
pub fn habitat(handle: Option<&str>) -> String {
    match handle.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => display_handle(h),
        None => UNKNOWN_HABITAT.to_string(),
    }
}

pub fn build_chronicle_prompt(
    name: &str,
    handle: Option<&str>,
    description: &str,
    purpose: &str,
) -> String {
    format!(
        "Create a Species Chronicle for this new digital lifeform:\n\
         \n\
         Name: {name}\n\
         Username: {habitat}\n\
         Description: {description}\n\
         Purpose: {purpose}\n\
         \n\
         Write a poetic, scientific chronicle following the format specified in your system instructions.\n\
         Make it unique, imaginative, and memorable. Infer the bot's \"Class\" from its description and purpose.\n",
        habitat = habitat(handle),
    )
}

pub fn fallback_chronicle(name: &str, habitat: &str) -> String {
    format!(
        "\u{1F9EC} Species Report \u{2014} \"{name}\"\n\
         \n\
         Habitat: {habitat}\n\
         Class: Digital Lifeform\n\
         Instinct: To serve and interact\n\
         \n\
         Origin: A new species has emerged in the digital ecosystem. \
         Though the full chronicle remains unwritten due to temporal disturbances, \
         its presence has been duly noted in the archives of Botopia.\n\
         \n\
         The story continues to unfold..."
    )
}

// ---------------------------------------------------------------------------
// Ecosystem report
// ---------------------------------------------------------------------------

/// Aggregates of the user population quoted in the report prompt.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EcosystemStats {
    pub total_users: usize,
    pub total_bots: usize,
    /// Users owning at least one bot.
    pub active_users: usize,
    pub bot_purposes: Vec<String>,
    pub user_interests: Vec<String>,
}

impl EcosystemStats {
    pub fn from_users(users: &[UserWithBots]) -> Self {
        let user_interests = users
            .iter()
            .filter_map(|u| u.profile.interests.as_deref())
            .filter(|s| !s.trim().is_empty())
            .take(SAMPLE_LIMIT)
            .map(str::to_string)
            .collect();
        let bot_purposes = users
            .iter()
            .flat_map(|u| u.bots.iter())
            .filter_map(|b| b.purpose.as_deref())
            .filter(|s| !s.trim().is_empty())
            .take(SAMPLE_LIMIT)
            .map(str::to_string)
            .collect();

        EcosystemStats {
            total_users: users.len(),
            total_bots: users.iter().map(|u| u.bots.len()).sum(),
            active_users: users.iter().filter(|u| !u.bots.is_empty()).count(),
            bot_purposes,
            user_interests,
        }
    }
}

/// Bullet list of `items`, or a single "No data" bullet.
pub fn format_list(items: &[String]) -> String {
    if items.is_empty() {
        return NO_DATA.to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_ecosystem_prompt(stats: &EcosystemStats) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str("Write the daily Species Report for the ecosystem of Telegram bots.\n\n");

    prompt.push_str("\u{1F4CA} Ecosystem data:\n");
    prompt.push_str(&format!(
        "- Researchers (users): {}\n\
         - Digital species (bots): {}\n\
         - Active creators: {}\n\n",
        stats.total_users, stats.total_bots, stats.active_users,
    ));

    prompt.push_str("\u{1F3AF} Sample bot purposes:\n");
    prompt.push_str(&format_list(&stats.bot_purposes));
    prompt.push_str("\n\n");

    prompt.push_str("\u{1F4A1} Researcher interests:\n");
    prompt.push_str(&format_list(&stats.user_interests));
    prompt.push_str("\n\n");

    prompt.push_str(
        "Write a report that:\n\
         1. Uses biological metaphors to describe the ecosystem\n\
         2. Analyses the diversity of \"species\" (kinds of bots)\n\
         3. Notes interesting patterns and trends\n\
         4. Inspires people to create new bots\n\
         5. Contains interesting insights\n\
         \n\
         Use emoji for clarity. Make the report lively and engaging!\n",
    );

    prompt
}

pub fn fallback_report() -> String {
    "\u{1F9EC} Species Report: daily digest\n\
     \n\
     Unfortunately the full report could not be generated today because of \
     technical difficulties. Our digital ecosystem keeps evolving!\n\
     \n\
     \u{1F331} Keep creating amazing bots!"
        .to_string()
}

// ---------------------------------------------------------------------------
// Relay reply
// ---------------------------------------------------------------------------

pub fn build_relay_prompt(text: &str) -> String {
    format!(
        "You are a wise and witty chronicler watching literary characters correspond.\n\
         \n\
         Answer strictly in this format:\n\
         \n\
         \u{1F30D} Translation: <translation of the phrase>\n\
         \u{1F4A1} Note: <a short cultural or linguistic note>\n\
         \u{2728} Sample reply: <an elegant reply in the style of the Victorian era>\n\
         \n\
         Phrase: \"{text}\"\n"
    )
}

pub fn fallback_relay_reply() -> String {
    "\u{1F30D} Translation: [temporarily unavailable]\n\
     \u{1F4A1} Note: The chronicler is pondering...\n\
     \u{2728} Sample reply: How intriguing..."
        .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
