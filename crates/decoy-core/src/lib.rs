//! decoy-core — shared domain types and configuration.
//!
//! Home of the configuration aggregate (`ManagerConfig`) and the domain
//! types every other crate builds on:
//!
//! - `BotAccount` — credentials for one automatable player slot
//! - `ServerSpec` — a target game server plus its capacity/timing policy
//! - `BotTimings` — inclusive second ranges the jittered delays draw from
//!
//! Configuration is a TOML file loaded once at startup and written back
//! with `save_to` after fields owned by configuration change (e.g. the
//! display name after a successful probe).

pub mod config;
pub mod error;
pub mod types;

pub use config::ManagerConfig;
pub use error::{ConfigError, ConfigResult};
pub use types::{BotAccount, BotTimings, ServerSpec};
