pub mod catalog;
pub mod clienv;
pub mod daemon;
pub mod error;
pub mod identifier;
pub mod logging;
pub mod preset;
pub mod preset_store;
pub mod puller;
pub mod resolver;
pub mod user_config;

#[cfg(test)]
mod testing;

pub use error::{DaemonError, Result};
pub use identifier::Identifier;
pub use preset::{LaunchSpec, Preset};
