//! Native in-process gateway
//!
//! Serves `/api/{service}/...` directly from a route table kept in sync
//! with the registry. Each request resolves its upstream through the load
//! balancer against a fresh registry snapshot; when balancing cannot pick
//! an instance the route entry's own URL is used as a fallback.

pub mod proxy;
pub mod routes;

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{Response, StatusCode};
use axum::routing::any;
use axum::Router;
use reqwest::Url;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::backend::GatewayBackend;
use crate::balancer::LoadBalancer;
use crate::error::{LunaError, LunaResult};
use crate::registry::{RegistryEvent, ServiceRegistry};

use self::proxy::{error_response, offline_response, ForwardingProxy};
use self::routes::{RouteEntry, RouteTable};

/// Reverse proxy backed by the registry and its event stream
pub struct NativeGateway {
    registry: Arc<ServiceRegistry>,
    balancer: Arc<LoadBalancer>,
    table: Arc<RwLock<RouteTable>>,
    proxy: ForwardingProxy,
}

impl NativeGateway {
    /// Create new native gateway
    pub fn new(registry: Arc<ServiceRegistry>, balancer: Arc<LoadBalancer>) -> LunaResult<Self> {
        Ok(Self {
            registry,
            balancer,
            table: Arc::new(RwLock::new(RouteTable::new())),
            proxy: ForwardingProxy::new()?,
        })
    }

    /// Router serving `/api/{service}` and everything below it
    pub fn create_router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/api/{service}", any(handle_root))
            .route("/api/{service}/{*rest}", any(handle))
            .with_state(self)
    }

    /// Bind the gateway listener and serve until the process stops
    pub async fn serve_http(self: Arc<Self>, addr: &str) -> LunaResult<()> {
        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            LunaError::Configuration(format!("failed to bind gateway listener {}: {}", addr, e))
        })?;
        info!(%addr, "native gateway listening");
        axum::serve(listener, self.create_router())
            .await
            .map_err(|e| LunaError::Proxy(format!("gateway server error: {}", e)))
    }

    /// Serve one request for `service_name` with the rewritten upstream path
    async fn serve(&self, service_name: &str, path: &str, request: Request) -> Response<Body> {
        let entry = {
            let table = self.table.read().await;
            table.get(service_name).cloned()
        };

        let fallback = match entry {
            None => {
                debug!(service = service_name, "no route installed");
                return error_response(
                    StatusCode::NOT_FOUND,
                    &format!("service '{}' is not registered", service_name),
                );
            }
            Some(RouteEntry::Unavailable) => {
                debug!(service = service_name, "service reported down");
                return offline_response();
            }
            Some(RouteEntry::Forward { fallback }) => fallback,
        };

        let target = self.resolve_target(service_name, fallback).await;
        match self.proxy.forward(&target, path, request).await {
            Ok(response) => response,
            Err(e) => {
                error!(service = service_name, error = %e, "forwarding failed");
                error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("failed to reach service '{}'", service_name),
                )
            }
        }
    }

    /// Pick an upstream through the balancer, falling back to the route URL
    async fn resolve_target(&self, service_name: &str, fallback: Url) -> Url {
        let snapshot = self.registry.get_all().await;
        match self.balancer.select(service_name, &snapshot).await {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    service = service_name,
                    error = %e,
                    "balancing failed, using route fallback"
                );
                fallback
            }
        }
    }
}

async fn handle_root(
    State(gateway): State<Arc<NativeGateway>>,
    Path(service): Path<String>,
    request: Request,
) -> Response<Body> {
    gateway.serve(&service, "/", request).await
}

async fn handle(
    State(gateway): State<Arc<NativeGateway>>,
    Path((service, rest)): Path<(String, String)>,
    request: Request,
) -> Response<Body> {
    gateway.serve(&service, &format!("/{}", rest), request).await
}

#[async_trait]
impl GatewayBackend for NativeGateway {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn check_preconditions(&self) -> LunaResult<()> {
        Ok(())
    }

    async fn sync_full(&self) -> LunaResult<()> {
        let snapshot = self.registry.get_all().await;
        let next = routes::from_snapshot(&snapshot);
        let installed = next.len();
        *self.table.write().await = next;
        info!(services = installed, "route table rebuilt");
        Ok(())
    }

    /// Build the next table aside, then swap it in whole
    async fn apply_event(&self, event: RegistryEvent) -> LunaResult<()> {
        let current = { self.table.read().await.clone() };
        let next = match event {
            RegistryEvent::Add(record) | RegistryEvent::Update(record) => {
                debug!(service = %record.name, "route installed");
                routes::with_service(current, &record)
            }
            RegistryEvent::Remove(instance_id) => {
                debug!(service = %instance_id.service_name(), "route uninstalled");
                routes::without_service(current, instance_id.service_name().as_str())
            }
        };
        *self.table.write().await = next;
        Ok(())
    }
}
