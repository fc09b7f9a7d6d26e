// Narrative generation: chronicle, ecosystem report and relay reply.
//
// Each operation always yields text. Backend failures are logged and
// replaced by the matching canned fallback.

use std::sync::Arc;

use tracing::{error, info};

use sapiens_core::config::LlmConfig;
use sapiens_core::model::UserWithBots;

use crate::client::{GenerationRequest, TextGenerator};
use crate::prompt;

const RELAY_TEMPERATURE: f32 = 0.7;
const RELAY_MAX_TOKENS: u32 = 150;

/// Sampling settings for the two scheduled kinds of text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NarrativeSettings {
    pub chronicle_temperature: f32,
    pub chronicle_max_tokens: u32,
    pub report_temperature: f32,
    pub report_max_tokens: u32,
}

impl Default for NarrativeSettings {
    fn default() -> Self {
        NarrativeSettings {
            chronicle_temperature: 0.85,
            chronicle_max_tokens: 500,
            report_temperature: 0.8,
            report_max_tokens: 2000,
        }
    }
}

impl From<&LlmConfig> for NarrativeSettings {
    fn from(config: &LlmConfig) -> Self {
        NarrativeSettings {
            chronicle_temperature: config.chronicle_temperature,
            chronicle_max_tokens: config.chronicle_max_tokens,
            report_temperature: config.report_temperature,
            report_max_tokens: config.report_max_tokens,
        }
    }
}

pub struct NarrativeGenerator {
    backend: Arc<dyn TextGenerator>,
    settings: NarrativeSettings,
}

impl NarrativeGenerator {
    pub fn new(backend: Arc<dyn TextGenerator>, settings: NarrativeSettings) -> Self {
        Self { backend, settings }
    }

    /// A "Species Report" for one bot.
    pub async fn generate_chronicle(
        &self,
        name: &str,
        handle: Option<&str>,
        description: &str,
        purpose: &str,
    ) -> String {
        info!("Generating chronicle for bot {name}");
        let request = GenerationRequest {
            system: prompt::chronicle_system_prompt(),
            prompt: prompt::build_chronicle_prompt(name, handle, description, purpose),
            temperature: self.settings.chronicle_temperature,
            max_tokens: self.settings.chronicle_max_tokens,
        };

        match self.backend.generate(&request).await {
            Ok(text) => {
                info!("Chronicle generated for bot {name}");
                text
            }
            Err(e) => {
                error!("Chronicle generation failed for bot {name}: {e}");
                prompt::fallback_chronicle(name, &prompt::habitat(handle))
            }
        }
    }

    /// The daily report over every user and bot.
    pub async fn generate_ecosystem_report(&self, users: &[UserWithBots]) -> String {
        info!("Generating ecosystem report for {} users", users.len());
        let stats = prompt::EcosystemStats::from_users(users);
        let request = GenerationRequest {
            system: prompt::report_system_prompt(),
            prompt: prompt::build_ecosystem_prompt(&stats),
            temperature: self.settings.report_temperature,
            max_tokens: self.settings.report_max_tokens,
        };

        match self.backend.generate(&request).await {
            Ok(text) => {
                info!("Ecosystem report generated");
                text
            }
            Err(e) => {
                error!("Ecosystem report generation failed: {e}");
                prompt::fallback_report()
            }
        }
    }

    /// Translation, note and sample reply for a phrase received over the relay.
    pub async fn generate_relay_reply(&self, text: &str) -> String {
        let request = GenerationRequest {
            system: prompt::relay_system_prompt(),
            prompt: prompt::build_relay_prompt(text),
            temperature: RELAY_TEMPERATURE,
            max_tokens: RELAY_MAX_TOKENS,
        };

        match self.backend.generate(&request).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Relay reply generation failed: {e}");
                prompt::fallback_relay_reply()
            }
        }
    }
}
