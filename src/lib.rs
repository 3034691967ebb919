//! portwarden: find the dev servers listening on this machine, pair them
//! with a registry of managed services, and start/stop those services.

#[cfg(not(unix))]
compile_error!("portwarden relies on unix process groups and signals");

pub mod app;
pub mod config;
pub mod health;
pub mod reconcile;
pub mod registry;
pub mod resolver;
pub mod scanner;
pub mod supervisor;
pub mod utils;

pub use app::App;
pub use config::Config;
