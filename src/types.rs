//! Identity and record types
//!
//! Every value that can reach the registry is validated at construction.
//! Invalid names, ports or weights never make it past the parse functions
//! in this module.

use crate::config::BalancerStrategy;
use crate::error::{LunaError, LunaResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical service name shared by every instance of one service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name(String);

impl Name {
    /// Parse a service name
    pub fn parse(value: &str) -> LunaResult<Self> {
        if value.trim().is_empty() {
            return Err(LunaError::Validation(
                "service name must not be empty".to_string(),
            ));
        }
        if value.contains(':') || value.chars().any(char::is_whitespace) {
            return Err(LunaError::Validation(format!(
                "service name '{}' must not contain ':' or whitespace",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Positive integer service version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(u32);

impl Version {
    /// Parse a version number
    pub fn new(value: u32) -> LunaResult<Self> {
        if value == 0 {
            return Err(LunaError::Validation(
                "version must be a positive integer".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network host component of an instance address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Hostname(String);

impl Hostname {
    /// Parse a hostname
    pub fn parse(value: &str) -> LunaResult<Self> {
        if value.trim().is_empty() {
            return Err(LunaError::Validation(
                "hostname must not be empty".to_string(),
            ));
        }
        if value.contains(':') || value.contains('/') || value.chars().any(char::is_whitespace) {
            return Err(LunaError::Validation(format!(
                "hostname '{}' must not contain ':', '/' or whitespace",
                value
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network port component of an instance address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Port(u16);

impl Port {
    /// Validate a port number
    pub fn new(value: u16) -> LunaResult<Self> {
        if value == 0 {
            return Err(LunaError::Validation(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Parse a port from its decimal string form
    pub fn parse(value: &str) -> LunaResult<Self> {
        let port: u16 = value.parse().map_err(|_| {
            LunaError::Validation(format!("port '{}' must be an integer between 1 and 65535", value))
        })?;
        Self::new(port)
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Composite instance identity, canonically formatted `name:hostname:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId {
    service_name: Name,
    hostname: Hostname,
    port: Port,
}

impl InstanceId {
    /// Create an instance id from its parts
    pub fn new(service_name: Name, hostname: Hostname, port: Port) -> Self {
        Self {
            service_name,
            hostname,
            port,
        }
    }

    /// Parse the canonical `name:hostname:port` form
    pub fn parse(raw: &str) -> LunaResult<Self> {
        let parts: Vec<&str> = raw.split(':').collect();
        if parts.len() != 3 {
            return Err(LunaError::Validation(format!(
                "instance id '{}' must be formatted name:hostname:port",
                raw
            )));
        }
        Ok(Self {
            service_name: Name::parse(parts[0])?,
            hostname: Hostname::parse(parts[1])?,
            port: Port::parse(parts[2])?,
        })
    }

    pub fn service_name(&self) -> &Name {
        &self.service_name
    }

    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    pub fn port(&self) -> Port {
        self.port
    }

    /// `hostname:port` address of the instance
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.service_name, self.hostname, self.port)
    }
}

/// Instance liveness as reported by the instance itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "DOWN")]
    Down,
}

/// Per-instance balancing options
///
/// `weight` is mandatory when the active strategy is `WeightedRoundRobin`
/// and must be at least 1 whenever it is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BalancerOptions {
    weight: Option<u32>,
}

impl BalancerOptions {
    /// Validate balancing options against the active strategy
    pub fn new(weight: Option<u32>, strategy: BalancerStrategy) -> LunaResult<Self> {
        match weight {
            None if strategy == BalancerStrategy::WeightedRoundRobin => {
                Err(LunaError::Validation(
                    "weight is required in balancerOptions when the weighted_round_robin strategy is active"
                        .to_string(),
                ))
            }
            Some(0) => Err(LunaError::Validation(
                "weight must be at least 1".to_string(),
            )),
            _ => Ok(Self { weight }),
        }
    }

    pub fn weight(&self) -> Option<u32> {
        self.weight
    }
}

/// One registered service instance
///
/// Records are constructed through [`ServiceRecord::new`] and only ever
/// created, replaced or removed by the registry. `last_heartbeat` is
/// stamped by the registry on every successful add and update.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRecord {
    pub instance_id: InstanceId,
    pub name: Name,
    pub description: String,
    pub version: Version,
    pub url: Url,
    pub balancer_options: BalancerOptions,
    pub status: Status,
    pub last_heartbeat: i64,
}

impl ServiceRecord {
    /// Create a record, enforcing that `name` matches the instance id
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        name: Name,
        description: String,
        version: Version,
        url: Url,
        balancer_options: BalancerOptions,
        status: Status,
    ) -> LunaResult<Self> {
        if &name != instance_id.service_name() {
            return Err(LunaError::Validation(format!(
                "record name '{}' does not match instance id service name '{}'",
                name,
                instance_id.service_name()
            )));
        }
        Ok(Self {
            instance_id,
            name,
            description,
            version,
            url,
            balancer_options,
            status,
            last_heartbeat: 0,
        })
    }
}

/// Wire form of a service record, as carried by the registration API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecordPayload {
    pub instance_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: u32,
    pub url: String,
    #[serde(default)]
    pub balancer_options: BalancerOptionsPayload,
    pub status: Status,
    #[serde(rename = "last_heartbeat", default)]
    pub last_heartbeat: i64,
}

/// Wire form of balancing options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BalancerOptionsPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl ServiceRecordPayload {
    /// Validate the payload into a record
    ///
    /// The wire `last_heartbeat` is ignored; the registry stamps its own.
    pub fn into_record(self, strategy: BalancerStrategy) -> LunaResult<ServiceRecord> {
        let instance_id = InstanceId::parse(&self.instance_id)?;
        let name = Name::parse(&self.name)?;
        let version = Version::new(self.version)?;
        let url = Url::parse(&self.url)
            .map_err(|e| LunaError::Validation(format!("invalid url '{}': {}", self.url, e)))?;
        if url.host_str().is_none() {
            return Err(LunaError::Validation(format!(
                "url '{}' must include a host",
                self.url
            )));
        }
        let balancer_options = BalancerOptions::new(self.balancer_options.weight, strategy)?;

        ServiceRecord::new(
            instance_id,
            name,
            self.description,
            version,
            url,
            balancer_options,
            self.status,
        )
    }

    /// Wire form of a stored record
    pub fn from_record(record: &ServiceRecord) -> Self {
        Self {
            instance_id: record.instance_id.to_string(),
            name: record.name.to_string(),
            description: record.description.clone(),
            version: record.version.value(),
            url: record.url.to_string(),
            balancer_options: BalancerOptionsPayload {
                weight: record.balancer_options.weight(),
            },
            status: record.status,
            last_heartbeat: record.last_heartbeat,
        }
    }
}
