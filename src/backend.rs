//! Gateway backend abstraction
//!
//! A gateway backend consumes registry mutations and keeps some routing
//! surface in agreement with them, whether that surface is an in-process
//! route table or an external proxy's config file.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::LunaResult;
use crate::registry::RegistryEvent;

#[async_trait]
pub trait GatewayBackend: Send + Sync {
    /// Short backend name used in logs
    fn name(&self) -> &'static str;

    /// Verify the environment before the backend is put in service
    async fn check_preconditions(&self) -> LunaResult<()>;

    /// Rebuild backend state from the full registry contents
    async fn sync_full(&self) -> LunaResult<()>;

    /// Apply a single registry mutation
    async fn apply_event(&self, event: RegistryEvent) -> LunaResult<()>;
}

/// Drive a backend from the registry event stream.
///
/// Events that fail to apply are logged and skipped. A lagged receiver
/// falls back to a full sync, after which the stream is consumed again.
pub fn spawn_event_loop(
    backend: Arc<dyn GatewayBackend>,
    mut events: broadcast::Receiver<RegistryEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = backend.apply_event(event).await {
                        error!(
                            backend = backend.name(),
                            error = %e,
                            "failed to apply registry event"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        backend = backend.name(),
                        skipped, "registry event stream lagged, running full sync"
                    );
                    if let Err(e) = backend.sync_full().await {
                        error!(backend = backend.name(), error = %e, "full sync failed");
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(backend = backend.name(), "registry event stream closed");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::BalancerStrategy;
    use crate::registry::ServiceRegistry;
    use crate::types::{
        BalancerOptions, InstanceId, Name, ServiceRecord, Status, Version,
    };

    fn record(service: &str, hostname: &str, port: u16) -> ServiceRecord {
        let instance_id =
            InstanceId::parse(&format!("{}:{}:{}", service, hostname, port)).unwrap();
        ServiceRecord::new(
            instance_id,
            Name::parse(service).unwrap(),
            String::new(),
            Version::new(1).unwrap(),
            format!("http://{}:{}/", hostname, port).parse().unwrap(),
            BalancerOptions::new(None, BalancerStrategy::None).unwrap(),
            Status::Ok,
        )
        .unwrap()
    }

    #[derive(Default)]
    struct RecordingBackend {
        events: tokio::sync::Mutex<Vec<RegistryEvent>>,
        synced: AtomicBool,
    }

    #[async_trait]
    impl GatewayBackend for RecordingBackend {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn check_preconditions(&self) -> LunaResult<()> {
            Ok(())
        }

        async fn sync_full(&self) -> LunaResult<()> {
            self.synced.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn apply_event(&self, event: RegistryEvent) -> LunaResult<()> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn event_loop_applies_registry_mutations() {
        let registry = Arc::new(ServiceRegistry::new());
        let backend = Arc::new(RecordingBackend::default());
        let handle = spawn_event_loop(backend.clone(), registry.subscribe());

        let added = registry.add(record("orders", "host1", 8080)).await.unwrap();
        registry.remove(&added.instance_id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = backend.events.lock().await;
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], RegistryEvent::Add(_)));
        assert!(matches!(seen[1], RegistryEvent::Remove(_)));
        handle.abort();
    }

    #[tokio::test]
    async fn lagged_receiver_falls_back_to_full_sync() {
        let registry = Arc::new(ServiceRegistry::new());
        // subscribe first, then overflow the channel before the loop starts
        let receiver = registry.subscribe();
        for i in 0..300 {
            let r = record("orders", &format!("host{}", i), 8080);
            registry.add(r).await.unwrap();
        }

        let backend = Arc::new(RecordingBackend::default());
        let handle = spawn_event_loop(backend.clone(), receiver);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(backend.synced.load(Ordering::SeqCst));
        handle.abort();
    }
}
