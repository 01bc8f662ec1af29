//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (REDWEB_HOST, REDWEB_PORT)
//! - TOML configuration file
//! - The `--config <path>` command line argument

use anyhow::{Context, Result};
use redweb_core::{DefaultHandler, DispatchPolicy, RouteConfig, ROOT_PATH};
use redweb_transport::ListenerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Socket routes. Empty means a single root route with the default
    /// handler.
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum HTTP upgrade request head size in bytes.
    #[serde(default = "default_max_head_size")]
    pub max_head_size: usize,

    /// Time allowed to send the upgrade request, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// A route as declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Upgrade path.
    pub path: String,

    /// Handler names, resolved against the handler catalog.
    pub handlers: Vec<String>,

    /// Key connections by a generated id instead of the remote IP.
    #[serde(default)]
    pub allow_duplicate_connections: bool,

    /// Dispatch policy.
    #[serde(default)]
    pub dispatch: DispatchPolicy,

    /// Services attached to the route.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

/// A service as declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service kind, e.g. `presence`.
    pub kind: String,

    /// Tick interval in milliseconds. Absent or zero disables ticking.
    #[serde(default)]
    pub tick_ms: Option<u64>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("REDWEB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("REDWEB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000)
}

fn default_true() -> bool {
    true
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_head_size() -> usize {
    8 * 1024
}

fn default_handshake_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            metrics: MetricsConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_head_size: default_max_head_size(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl RouteSpec {
    /// The root route served by the default handler.
    #[must_use]
    pub fn root() -> Self {
        Self {
            path: ROOT_PATH.to_string(),
            handlers: vec![DefaultHandler::NAME.to_string()],
            allow_duplicate_connections: false,
            dispatch: DispatchPolicy::PerMessage,
            services: Vec::new(),
        }
    }

    /// Get the core route configuration.
    #[must_use]
    pub fn route_config(&self) -> RouteConfig {
        RouteConfig::new(self.path.clone())
            .allow_duplicates(self.allow_duplicate_connections)
            .dispatch(self.dispatch)
    }
}

impl ServiceSpec {
    /// Get the tick interval, if ticking is enabled.
    #[must_use]
    pub fn tick_interval(&self) -> Option<Duration> {
        self.tick_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

impl Config {
    /// Load configuration from an explicit file, the default paths, or
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// an explicit path cannot be read.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        // Try to load from default paths
        let config_paths = [
            "redweb.toml",
            "/etc/redweb/redweb.toml",
            "~/.config/redweb/redweb.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Get the listener configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address is invalid.
    pub fn listener(&self) -> Result<ListenerConfig> {
        Ok(ListenerConfig {
            bind_addr: self.bind_addr()?,
            max_message_size: self.limits.max_message_size,
            max_head_size: self.limits.max_head_size,
            handshake_timeout: Duration::from_millis(self.limits.handshake_timeout_ms),
        })
    }
}
