//! Bluetooth audio orchestrator core.
//!
//! Manages Bluetooth Classic audio devices (speakers, headsets) by
//! coordinating the BlueZ object tree on the system bus, the
//! PulseAudio server, and per-device MPD instances. The
//! [`manager::Manager`] is the entry point; [`api`] exposes the
//! control-plane handlers an external HTTP/WebSocket transport serves,
//! and [`events::EventBus`] carries the live event stream.

pub mod api;
pub mod audio;
pub mod bluez;
pub mod config;
pub mod errors;
pub mod events;
pub mod idle;
pub mod manager;
pub mod reconnect;
pub mod store;
