// Chat bot: dialogues, channel publishing, the daily report and the relay.

pub mod app;
pub mod broadcaster;
pub mod conversation;
pub mod markup;
pub mod relay;
pub mod scheduler;
pub mod transport;
