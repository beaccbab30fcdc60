//! # botlink-settings
//!
//! Configuration for the botlink supervisor, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`BotSettings::default()`]
//! 2. **Settings file**: `~/.botlink/settings.json` or an explicit path
//! 3. **Environment variables**: `BOTLINK_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, merge_into, load_settings_from_path, settings_path};
pub use types::*;
