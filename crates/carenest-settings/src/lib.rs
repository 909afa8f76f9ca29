//! # carenest-settings
//!
//! Layered configuration for the carenest gateway.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`CarenestSettings::default()`]
//! 2. **Settings file**: `~/.carenest/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `CARENEST_*` overrides (highest priority)
//!
//! Call [`CarenestSettings::validate`] after loading; the loader itself only
//! checks syntax and types.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
