//! Load-balancing strategies
//!
//! One strategy is resolved from configuration at startup and consulted
//! with registry snapshots for the lifetime of the process. Despite its
//! historical name, `WeightedRoundRobin` draws instances at weighted
//! random rather than cycling.

use crate::config::BalancerStrategy;
use crate::error::{LunaError, LunaResult};
use crate::types::ServiceRecord;
use rand::Rng;
use reqwest::Url;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Instance selector for the configured strategy
pub struct LoadBalancer {
    strategy: BalancerStrategy,
    cursors: Mutex<HashMap<String, usize>>,
}

impl LoadBalancer {
    /// Create new load balancer
    pub fn new(strategy: BalancerStrategy) -> Self {
        Self {
            strategy,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Select one instance URL for a service from a registry snapshot
    ///
    /// Instance order within the snapshot is registration order. Strategies
    /// never mutate the registry; the only expected error is a lookup
    /// against a service with zero instances.
    pub async fn select(&self, service_name: &str, snapshot: &[ServiceRecord]) -> LunaResult<Url> {
        let candidates: Vec<&ServiceRecord> = snapshot
            .iter()
            .filter(|r| r.name.as_str() == service_name)
            .collect();

        if candidates.is_empty() {
            // a name with no instances left keeps no cursor state
            self.cursors.lock().await.remove(service_name);
            return Err(LunaError::NoInstances(format!(
                "no instances registered for service {}",
                service_name
            )));
        }

        let selected = match self.strategy {
            BalancerStrategy::None => candidates[0],
            BalancerStrategy::RoundRobin => self.select_round_robin(service_name, &candidates).await,
            BalancerStrategy::WeightedRoundRobin => self.select_weighted(&candidates),
        };

        debug!("Selected {} for service {}", selected.url, service_name);
        Ok(selected.url.clone())
    }

    /// Cycle through instances, one cursor per service name
    ///
    /// When instances disappeared since the last call the cursor is clamped
    /// back into range, so selection continues over the survivors.
    async fn select_round_robin<'a>(
        &self,
        service_name: &str,
        candidates: &[&'a ServiceRecord],
    ) -> &'a ServiceRecord {
        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(service_name.to_string()).or_insert(0);
        if *cursor >= candidates.len() {
            *cursor = 0;
        }
        let index = *cursor;
        *cursor = index + 1;
        candidates[index]
    }

    /// Weighted random selection
    ///
    /// Draws uniformly from `[0, total weight)` and walks the cumulative
    /// weights in registration order. The last instance wins if
    /// floating-point slop leaves the draw unmatched.
    fn select_weighted<'a>(&self, candidates: &[&'a ServiceRecord]) -> &'a ServiceRecord {
        // per-instance weights are u32, their sum can exceed u32::MAX
        let total: u64 = candidates
            .iter()
            .map(|r| u64::from(r.balancer_options.weight().unwrap_or(0)))
            .sum();
        if total == 0 {
            return candidates[0];
        }

        let draw = rand::thread_rng().gen_range(0.0..total as f64);
        let mut running = 0.0;
        for record in candidates {
            running += f64::from(record.balancer_options.weight().unwrap_or(0));
            if running >= draw {
                return record;
            }
        }
        candidates[candidates.len() - 1]
    }
}
