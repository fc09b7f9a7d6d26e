// Generative-text client and the narratives built on top of it.

pub mod client;
pub mod narrative;
pub mod prompt;

pub use client::{GenerationRequest, LlmClient, LlmError, TextGenerator};
pub use narrative::{NarrativeGenerator, NarrativeSettings};
