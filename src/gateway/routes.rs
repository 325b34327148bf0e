//! Gateway route table
//!
//! Maps service names to forwarding state. Tables are plain values: event
//! handling builds the next table aside and swaps it in whole, so readers
//! never observe a half-applied mutation.

use std::collections::HashMap;

use reqwest::Url;

use crate::types::{ServiceRecord, Status};

/// Forwarding state for one service name
#[derive(Debug, Clone, PartialEq)]
pub enum RouteEntry {
    /// The service's most recent record reported DOWN
    Unavailable,
    /// Service is live. `fallback` is the URL of the record that produced
    /// this entry, used when balancing cannot pick an instance.
    Forward { fallback: Url },
}

pub type RouteTable = HashMap<String, RouteEntry>;

fn entry_for(record: &ServiceRecord) -> RouteEntry {
    match record.status {
        Status::Down => RouteEntry::Unavailable,
        Status::Ok => RouteEntry::Forward {
            fallback: record.url.clone(),
        },
    }
}

/// Table with the entry for one record installed or replaced
pub fn with_service(mut table: RouteTable, record: &ServiceRecord) -> RouteTable {
    table.insert(record.name.to_string(), entry_for(record));
    table
}

/// Table with a service name uninstalled entirely
pub fn without_service(mut table: RouteTable, service_name: &str) -> RouteTable {
    table.remove(service_name);
    table
}

/// Table built from a registry snapshot; the last record for a name wins
pub fn from_snapshot(records: &[ServiceRecord]) -> RouteTable {
    let mut table = RouteTable::new();
    for record in records {
        table.insert(record.name.to_string(), entry_for(record));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalancerStrategy;
    use crate::types::{BalancerOptions, InstanceId, Name, Version};

    fn record(service: &str, hostname: &str, port: u16, status: Status) -> ServiceRecord {
        let instance_id =
            InstanceId::parse(&format!("{}:{}:{}", service, hostname, port)).unwrap();
        ServiceRecord::new(
            instance_id,
            Name::parse(service).unwrap(),
            String::new(),
            Version::new(1).unwrap(),
            format!("http://{}:{}/", hostname, port).parse().unwrap(),
            BalancerOptions::new(None, BalancerStrategy::None).unwrap(),
            status,
        )
        .unwrap()
    }

    #[test]
    fn live_record_installs_a_forward_entry() {
        let table = with_service(RouteTable::new(), &record("orders", "host1", 8080, Status::Ok));
        match table.get("orders") {
            Some(RouteEntry::Forward { fallback }) => {
                assert_eq!(fallback.as_str(), "http://host1:8080/");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn down_record_installs_an_unavailable_entry() {
        let table = with_service(
            RouteTable::new(),
            &record("orders", "host1", 8080, Status::Down),
        );
        assert_eq!(table.get("orders"), Some(&RouteEntry::Unavailable));
    }

    #[test]
    fn newer_record_replaces_the_entry() {
        let table = with_service(RouteTable::new(), &record("orders", "host1", 8080, Status::Ok));
        let table = with_service(table, &record("orders", "host2", 9090, Status::Ok));

        assert_eq!(table.len(), 1);
        match table.get("orders") {
            Some(RouteEntry::Forward { fallback }) => {
                assert_eq!(fallback.as_str(), "http://host2:9090/");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn without_service_uninstalls_the_whole_name() {
        let table = with_service(RouteTable::new(), &record("orders", "host1", 8080, Status::Ok));
        let table = with_service(table, &record("billing", "host1", 8081, Status::Ok));

        let table = without_service(table, "orders");
        assert!(!table.contains_key("orders"));
        assert!(table.contains_key("billing"));
    }

    #[test]
    fn snapshot_keeps_the_last_record_per_name() {
        let records = vec![
            record("orders", "host1", 8080, Status::Ok),
            record("billing", "host1", 8081, Status::Ok),
            record("orders", "host2", 9090, Status::Down),
        ];
        let table = from_snapshot(&records);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get("orders"), Some(&RouteEntry::Unavailable));
        assert!(matches!(
            table.get("billing"),
            Some(RouteEntry::Forward { .. })
        ));
    }
}
