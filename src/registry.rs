//! In-memory service registry
//!
//! The registry is the single source of truth for instances. Records are
//! kept in registration order, writers are serialized behind one lock, and
//! every successful mutation emits exactly one event on the broadcast
//! channel before the write lock is released. A subscriber that reads the
//! registry after receiving event N therefore always observes state at
//! least as new as N.

use crate::error::{LunaError, LunaResult};
use crate::types::{InstanceId, ServiceRecord};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Capacity of the registry event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted after every successful registry mutation
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Add(ServiceRecord),
    Update(ServiceRecord),
    Remove(InstanceId),
}

/// In-memory store of service instances
pub struct ServiceRegistry {
    records: Arc<RwLock<Vec<ServiceRecord>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    /// Create new registry
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a new instance
    ///
    /// Fails when the instance id is already present. The stored record's
    /// `last_heartbeat` is stamped server-side.
    pub async fn add(&self, mut record: ServiceRecord) -> LunaResult<ServiceRecord> {
        let mut records = self.records.write().await;
        if records.iter().any(|r| r.instance_id == record.instance_id) {
            return Err(LunaError::DuplicateInstance(format!(
                "instance {} is already registered",
                record.instance_id
            )));
        }

        record.last_heartbeat = chrono::Utc::now().timestamp_millis();
        records.push(record.clone());
        debug!("Registered instance {}", record.instance_id);

        let _ = self.events.send(RegistryEvent::Add(record.clone()));
        Ok(record)
    }

    /// Replace the stored record for an already registered instance
    ///
    /// The record is replaced wholesale, never merged.
    pub async fn update(&self, mut record: ServiceRecord) -> LunaResult<ServiceRecord> {
        let mut records = self.records.write().await;
        let Some(stored) = records
            .iter_mut()
            .find(|r| r.instance_id == record.instance_id)
        else {
            return Err(LunaError::NotRegistered(format!(
                "instance {} is not registered",
                record.instance_id
            )));
        };

        record.last_heartbeat = chrono::Utc::now().timestamp_millis();
        *stored = record.clone();
        debug!("Updated instance {}", record.instance_id);

        let _ = self.events.send(RegistryEvent::Update(record.clone()));
        Ok(record)
    }

    /// Remove an instance, returning the removed record
    pub async fn remove(&self, instance_id: &InstanceId) -> LunaResult<ServiceRecord> {
        let mut records = self.records.write().await;
        let Some(position) = records.iter().position(|r| &r.instance_id == instance_id) else {
            return Err(LunaError::NotRegistered(format!(
                "instance {} is not registered",
                instance_id
            )));
        };

        let removed = records.remove(position);
        debug!("Removed instance {}", instance_id);

        let _ = self.events.send(RegistryEvent::Remove(instance_id.clone()));
        Ok(removed)
    }

    /// Look up one instance
    pub async fn find_by_instance_id(&self, instance_id: &InstanceId) -> Option<ServiceRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| &r.instance_id == instance_id)
            .cloned()
    }

    /// All instances of one logical service, in registration order
    pub async fn find_all_by_name(&self, name: &str) -> Vec<ServiceRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.name.as_str() == name)
            .cloned()
            .collect()
    }

    /// Full snapshot of every registered instance, in registration order
    pub async fn get_all(&self) -> Vec<ServiceRecord> {
        self.records.read().await.clone()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerStrategy;
    use crate::types::{BalancerOptionsPayload, ServiceRecordPayload, Status};

    fn record(service: &str, host: &str, port: u16) -> ServiceRecord {
        ServiceRecordPayload {
            instance_id: format!("{}:{}:{}", service, host, port),
            name: service.to_string(),
            description: String::new(),
            version: 1,
            url: format!("http://{}:{}/", host, port),
            balancer_options: BalancerOptionsPayload { weight: None },
            status: Status::Ok,
            last_heartbeat: 0,
        }
        .into_record(BalancerStrategy::None)
        .unwrap()
    }

    #[tokio::test]
    async fn add_then_find_returns_the_record() {
        let registry = ServiceRegistry::new();
        let stored = registry.add(record("orders", "host1", 8080)).await.unwrap();

        let found = registry
            .find_by_instance_id(&stored.instance_id)
            .await
            .unwrap();
        assert_eq!(found, stored);
        assert!(found.last_heartbeat > 0);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let registry = ServiceRegistry::new();
        registry.add(record("orders", "host1", 8080)).await.unwrap();

        let err = registry
            .add(record("orders", "host1", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, LunaError::DuplicateInstance(_)));
    }

    #[tokio::test]
    async fn update_replaces_the_record_wholesale() {
        let registry = ServiceRegistry::new();
        registry.add(record("orders", "host1", 8080)).await.unwrap();

        let mut replacement = record("orders", "host1", 8080);
        replacement.description = "replaced".to_string();
        replacement.status = Status::Down;
        let stored = registry.update(replacement).await.unwrap();

        let found = registry
            .find_by_instance_id(&stored.instance_id)
            .await
            .unwrap();
        assert_eq!(found.description, "replaced");
        assert_eq!(found.status, Status::Down);
    }

    #[tokio::test]
    async fn update_of_unknown_instance_is_rejected() {
        let registry = ServiceRegistry::new();
        let err = registry
            .update(record("orders", "host1", 8080))
            .await
            .unwrap_err();
        assert!(matches!(err, LunaError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn remove_then_find_reports_not_found() {
        let registry = ServiceRegistry::new();
        let stored = registry.add(record("orders", "host1", 8080)).await.unwrap();

        registry.remove(&stored.instance_id).await.unwrap();
        assert!(registry
            .find_by_instance_id(&stored.instance_id)
            .await
            .is_none());

        let err = registry.remove(&stored.instance_id).await.unwrap_err();
        assert!(matches!(err, LunaError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn snapshots_preserve_registration_order() {
        let registry = ServiceRegistry::new();
        registry.add(record("orders", "host1", 8081)).await.unwrap();
        registry.add(record("billing", "host1", 8082)).await.unwrap();
        registry.add(record("orders", "host2", 8083)).await.unwrap();

        let all = registry.get_all().await;
        let ids: Vec<String> = all.iter().map(|r| r.instance_id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "orders:host1:8081",
                "billing:host1:8082",
                "orders:host2:8083"
            ]
        );

        let orders = registry.find_all_by_name("orders").await;
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].instance_id.to_string(), "orders:host1:8081");
        assert_eq!(orders[1].instance_id.to_string(), "orders:host2:8083");
    }

    #[tokio::test]
    async fn every_mutation_emits_exactly_one_event() {
        let registry = ServiceRegistry::new();
        let mut events = registry.subscribe();

        let stored = registry.add(record("orders", "host1", 8080)).await.unwrap();
        registry.update(record("orders", "host1", 8080)).await.unwrap();
        registry.remove(&stored.instance_id).await.unwrap();

        match events.recv().await.unwrap() {
            RegistryEvent::Add(r) => assert_eq!(r.instance_id, stored.instance_id),
            other => panic!("expected add event, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            RegistryEvent::Update(r) => assert_eq!(r.instance_id, stored.instance_id),
            other => panic!("expected update event, got {:?}", other),
        }
        match events.recv().await.unwrap() {
            RegistryEvent::Remove(id) => assert_eq!(id, stored.instance_id),
            other => panic!("expected remove event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn event_observers_see_post_mutation_state() {
        let registry = ServiceRegistry::new();
        let mut events = registry.subscribe();

        let stored = registry.add(record("orders", "host1", 8080)).await.unwrap();
        let RegistryEvent::Add(event_record) = events.recv().await.unwrap() else {
            panic!("expected add event");
        };

        let found = registry
            .find_by_instance_id(&event_record.instance_id)
            .await
            .unwrap();
        assert_eq!(found, stored);
    }

    #[tokio::test]
    async fn failed_mutations_emit_no_event() {
        let registry = ServiceRegistry::new();
        registry.add(record("orders", "host1", 8080)).await.unwrap();
        let mut events = registry.subscribe();

        let _ = registry.add(record("orders", "host1", 8080)).await;
        let _ = registry
            .remove(&InstanceId::parse("billing:host9:9999").unwrap())
            .await;

        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
