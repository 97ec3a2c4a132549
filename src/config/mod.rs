pub mod schema;

pub use schema::{resolve_config_path, BrowserConfig, Config, ReliabilityConfig, CONFIG_ENV};
