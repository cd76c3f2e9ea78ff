//! Application configuration
//!
//! Sources, lowest precedence first: config file (`conf/application.*` or
//! `--config`), `TESSERA_*` environment variables (`__` separates
//! sections, e.g. `TESSERA_SERVER__ENDPOINT`), command line flags.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use tessera_common::{is_valid_service_name, local_ip};
use tessera_discovery::{ConsulClientConfig, ServiceDescriptor};

use crate::error::{Result, ServerError};
use crate::startup::logging::LoggingConfig;

/// Command line arguments for the server
#[derive(Debug, Default, Parser)]
#[command(name = "tessera", version, about)]
pub struct Cli {
    /// Config file path (default: conf/application.{yml,toml,json}, optional)
    #[arg(short = 'c', long = "config", env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,
    /// Service name registered with the discovery backend
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,
    /// Listen endpoint (host:port) shared by gRPC and HTTP
    #[arg(short = 'e', long = "endpoint")]
    pub endpoint: Option<String>,
    /// Environment tag used for registration and resolution
    #[arg(long = "environment")]
    pub environment: Option<String>,
    /// Discovery backend agent address
    #[arg(long = "consul")]
    pub consul: Option<String>,
}

/// `server` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub endpoint: String,
    /// Address advertised to the discovery backend (default: first non-loopback IPv4)
    pub advertise_address: Option<String>,
    pub environment: String,
    /// Cap on concurrently open connections
    pub max_connections: usize,
    /// Log request metadata of gRPC calls at debug level
    pub log_payloads: bool,
    /// Deadline for each shutdown step
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Deregister explicitly after the health flip on shutdown
    pub deregister_on_shutdown: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: "0.0.0.0:8080".to_string(),
            advertise_address: None,
            environment: "dev".to_string(),
            max_connections: 10_000,
            log_payloads: true,
            shutdown_timeout: Duration::from_secs(30),
            deregister_on_shutdown: false,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .parse()
            .map_err(|e| {
                ServerError::Config(format!("invalid endpoint '{}': {}", self.endpoint, e))
            })
    }

    pub fn advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(local_ip)
    }
}

/// `consul` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsulConfig {
    pub endpoint: String,
    pub token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub deregister_after: Duration,
    /// Long-poll timeout of resolver health queries
    #[serde(with = "humantime_serde")]
    pub watch_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub registration_retry_window: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8500".to_string(),
            token: None,
            health_check_interval: Duration::from_secs(10),
            deregister_after: Duration::from_secs(60),
            watch_wait: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            registration_retry_window: Duration::from_secs(30),
        }
    }
}

impl ConsulConfig {
    pub fn client_config(&self) -> ConsulClientConfig {
        ConsulClientConfig::new(self.endpoint.clone())
            .with_token(self.token.clone())
            .with_request_timeout(self.request_timeout)
    }
}

/// Application configuration loaded from config files, environment and CLI
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub consul: ConsulConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from the sources named by `cli` and validate
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match &cli.config {
            Some(path) => builder.add_source(File::from(path.as_path()).required(true)),
            None => builder.add_source(File::with_name("conf/application").required(false)),
        };

        builder = builder.add_source(
            Environment::with_prefix("TESSERA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(v) = &cli.name {
            builder = builder.set_override("server.name", v.as_str())?;
        }
        if let Some(v) = &cli.endpoint {
            builder = builder.set_override("server.endpoint", v.as_str())?;
        }
        if let Some(v) = &cli.environment {
            builder = builder.set_override("server.environment", v.as_str())?;
        }
        if let Some(v) = &cli.consul {
            builder = builder.set_override("consul.endpoint", v.as_str())?;
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() {
            return Err(ServerError::Config("server.name is required".to_string()));
        }
        if !is_valid_service_name(&self.server.name) {
            return Err(ServerError::Config(format!(
                "server.name '{}' is not a valid service name",
                self.server.name
            )));
        }
        self.server.socket_addr()?;
        if self.server.max_connections == 0 {
            return Err(ServerError::Config(
                "server.max_connections must be positive".to_string(),
            ));
        }

        let timeouts = [
            ("server.shutdown_timeout", self.server.shutdown_timeout),
            ("consul.health_check_interval", self.consul.health_check_interval),
            ("consul.deregister_after", self.consul.deregister_after),
            ("consul.watch_wait", self.consul.watch_wait),
            ("consul.request_timeout", self.consul.request_timeout),
        ];
        for (key, value) in timeouts {
            if value.is_zero() {
                return Err(ServerError::Config(format!("{} must be non-zero", key)));
            }
        }
        Ok(())
    }

    /// Registration descriptor for an instance listening on `port`
    pub fn descriptor(&self, port: u16) -> ServiceDescriptor {
        ServiceDescriptor::new(
            self.server.name.clone(),
            self.server.advertise_address(),
            port,
        )
        .with_tag(self.server.environment.clone())
        .with_health_check_interval(self.consul.health_check_interval)
        .with_deregister_after(self.consul.deregister_after)
    }
}
