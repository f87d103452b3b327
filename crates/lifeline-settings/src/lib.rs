//! # lifeline-settings
//!
//! Configuration for the Lifeline connection engine.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`EngineSettings::default()`]
//! 2. **Settings file**: `$LIFELINE_HOME/settings.json` or
//!    `~/.lifeline/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `LIFELINE_*` overrides (highest priority)
//!
//! There is no global instance: the loaded value is handed to the engine
//! once at construction.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
