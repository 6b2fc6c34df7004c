pub mod config;
pub mod inbox;
pub mod registration;
pub mod serve;
pub mod user;

use anyhow::Context;
use hopper_core::config::Config;
use std::path::Path;

/// Load the config at `path`, naming the file in the error.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::load(path).with_context(|| format!("failed to load config {}", path.display()))
}
