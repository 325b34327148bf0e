//! Luna service registry and gateway
//!
//! Luna keeps a registry of live service instances, balances traffic
//! across them, and puts every registered service behind one gateway,
//! either served in-process or projected into an nginx configuration.

pub mod api;
pub mod backend;
pub mod balancer;
pub mod config;
pub mod error;
pub mod gateway;
pub mod nginx;
pub mod registry;
pub mod types;

// Re-export main types
pub use backend::GatewayBackend;
pub use balancer::LoadBalancer;
pub use config::LunaConfig;
pub use error::{LunaError, LunaResult};
pub use gateway::NativeGateway;
pub use nginx::NginxBackend;
pub use registry::{RegistryEvent, ServiceRegistry};
pub use types::*;

/// Luna version information
pub const LUNA_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Luna service name
pub const LUNA_NAME: &str = "luna";

/// Default registration API endpoint
pub const DEFAULT_API_ENDPOINT: &str = "0.0.0.0:7777";

/// Default native gateway endpoint
pub const DEFAULT_GATEWAY_ENDPOINT: &str = "0.0.0.0:8080";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_wired_from_the_manifest() {
        assert!(!LUNA_VERSION.is_empty());
        assert_eq!(LUNA_NAME, "luna");
    }
}
