pub mod keepalive;
pub mod mpd;
pub mod pulse;
