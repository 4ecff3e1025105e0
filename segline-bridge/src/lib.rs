//! Tokio collaborators for segline: a stream transport, configuration,
//! logging setup and download/serve drivers.

pub mod bridge;
pub mod config;
pub mod driver;
pub mod logging;

pub use bridge::BridgeTransport;
pub use config::{load, load_from, Config, ConfigError, ResizeMode};
pub use driver::{download, download_many, serve, DownloadOutcome};
pub use logging::init_logging;
