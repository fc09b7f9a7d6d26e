// Library root: configuration, the profile data model and the profile store
// backends shared by the bot and the narrative generator.

pub mod config;
pub mod model;
pub mod store;
