pub mod agent;
pub mod constants;
pub mod device;
pub mod media_player;
pub mod profile;
pub mod watcher;
