//! Configuration for Luna

use crate::error::{LunaError, LunaResult};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LunaConfig {
    /// Registration API settings
    pub server: ServerConfig,

    /// Registry behavior settings
    pub registry: RegistryConfig,

    /// Load balancing settings
    pub balancer: BalancerConfig,

    /// Gateway backend settings
    pub gateway: GatewayConfig,

    /// Nginx adapter settings
    pub nginx: NginxConfig,
}

impl Default for LunaConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            balancer: BalancerConfig::default(),
            gateway: GatewayConfig::default(),
            nginx: NginxConfig::default(),
        }
    }
}

impl LunaConfig {
    /// Load configuration from the path in `LUNA_CONFIG`, then `luna.toml`, then defaults
    pub async fn load() -> LunaResult<Self> {
        if let Ok(path) = std::env::var("LUNA_CONFIG") {
            return Self::from_file(&path).await;
        }

        if let Ok(config) = Self::from_file("luna.toml").await {
            return Ok(config);
        }

        warn!("No configuration found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a TOML file
    pub async fn from_file(path: &str) -> LunaResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            LunaError::Configuration(format!("failed to read config file {}: {}", path, e))
        })?;

        let config: LunaConfig = toml::from_str(&content).map_err(|e| {
            LunaError::Configuration(format!("failed to parse config file {}: {}", path, e))
        })?;

        Ok(config)
    }
}

/// Registration API server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7777,
        }
    }
}

/// Registry behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected seconds between instance heartbeats, used for lateness logging
    pub heartbeat_interval_secs: u64,

    /// Basic auth username for the registration API
    pub username: Option<String>,

    /// Basic auth password for the registration API
    pub password: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            username: None,
            password: None,
        }
    }
}

/// Load balancing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Active selection strategy
    pub strategy: BalancerStrategy,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancerStrategy::None,
        }
    }
}

/// Selection strategies
///
/// `RoundRobin` cycles through instances in registration order.
/// `WeightedRoundRobin` keeps its historical name but performs weighted
/// random selection, biased by each instance's `weight`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerStrategy {
    None,
    RoundRobin,
    WeightedRoundRobin,
}

/// Gateway backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Active backend
    pub backend: GatewayBackendKind,

    /// Native gateway bind host
    pub host: String,

    /// Native gateway bind port
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: GatewayBackendKind::Native,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Gateway backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayBackendKind {
    Native,
    Nginx,
}

/// Nginx adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NginxConfig {
    /// Path of the managed nginx configuration file
    pub config_path: String,
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            config_path: "/etc/nginx/nginx.conf".to_string(),
        }
    }
}
