//! # tether-settings
//!
//! Configuration for the Tether session manager, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`TetherSettings::default()`]
//! 2. **User file**: `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! [`TetherSettings::validate`] rejects inconsistent or incomplete setups
//! before anything is started.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;
mod validate;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path, tether_home};
pub use types::*;
