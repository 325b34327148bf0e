//! Main binary for Luna

use std::sync::Arc;

use luna::api::{self, ApiState};
use luna::backend::{spawn_event_loop, GatewayBackend};
use luna::balancer::LoadBalancer;
use luna::config::{BalancerStrategy, GatewayBackendKind, LunaConfig};
use luna::gateway::NativeGateway;
use luna::nginx::NginxBackend;
use luna::registry::ServiceRegistry;
use luna::{LUNA_NAME, LUNA_VERSION};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting {} v{}", LUNA_NAME, LUNA_VERSION);

    // Load configuration
    let config = Arc::new(LunaConfig::load().await?);
    info!("Configuration loaded successfully");

    let registry = Arc::new(ServiceRegistry::new());
    let balancer = Arc::new(LoadBalancer::new(config.balancer.strategy));
    info!(strategy = ?config.balancer.strategy, "Load balancer ready");

    // Start the configured gateway backend
    match config.gateway.backend {
        GatewayBackendKind::Native => {
            let gateway = Arc::new(NativeGateway::new(registry.clone(), balancer.clone())?);
            gateway.check_preconditions().await?;
            gateway.sync_full().await?;
            spawn_event_loop(gateway.clone(), registry.subscribe());

            let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
            tokio::spawn(async move {
                if let Err(e) = gateway.serve_http(&addr).await {
                    error!("Native gateway server error: {}", e);
                }
            });
        }
        GatewayBackendKind::Nginx => {
            let weighted = config.balancer.strategy == BalancerStrategy::WeightedRoundRobin;
            let backend = Arc::new(NginxBackend::new(
                config.nginx.clone(),
                registry.clone(),
                weighted,
            ));
            if let Err(e) = backend.check_preconditions().await {
                error!("Nginx backend preconditions failed: {}", e);
                std::process::exit(1);
            }
            backend.sync_full().await?;
            spawn_event_loop(backend, registry.subscribe());
        }
    }

    // Serve the registration API
    let state = ApiState {
        registry: registry.clone(),
        config: config.clone(),
    };
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Starting registration API on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!("Registration API server error: {}", e);
    }

    info!("Luna shutdown completed");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, shutting down");
        }
        _ = terminate => {
            info!("SIGTERM received, shutting down");
        }
    }

    info!("Shutdown signal received");
}
