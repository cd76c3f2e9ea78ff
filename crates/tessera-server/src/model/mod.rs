pub mod config;

pub use config::{AppConfig, Cli, ConsulConfig, ServerConfig};
