//! Instance selection for discovery
//!
//! Picks one instance out of an already-filtered eligible set. Selection
//! state for the stateful strategies lives per service in a `DashMap`.

use std::collections::HashMap;

use dashmap::DashMap;
use gatehub_core::models::{LoadBalanceStrategy, ServiceInstance, ServiceKey};
use rand::RngExt;

#[derive(Debug, Default)]
struct SelectionState {
    round_robin: usize,
    /// Smooth weighted round robin current weights by instance id
    current_weights: HashMap<String, i64>,
}

/// Strategy-driven instance picker
#[derive(Debug, Default)]
pub struct LoadBalancer {
    states: DashMap<ServiceKey, SelectionState>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Select one instance out of `eligible`, or `None` when it is empty.
    ///
    /// `eligible` must be in insertion order; ties and the all-zero-weight
    /// fallback resolve to the earliest instance.
    pub fn select<'a>(
        &self,
        key: &ServiceKey,
        strategy: LoadBalanceStrategy,
        eligible: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if eligible.is_empty() {
            return None;
        }

        match strategy {
            LoadBalanceStrategy::WeightedRandom => {
                let total = total_weight(eligible);
                if total == 0 {
                    return eligible.first();
                }
                let offset = rand::rng().random_range(0..total);
                pick_by_offset(eligible, offset)
            }
            LoadBalanceStrategy::WeightedRoundRobin => self.smooth_weighted(key, eligible),
            LoadBalanceStrategy::RoundRobin => {
                let mut state = self.states.entry(key.clone()).or_default();
                let index = state.round_robin % eligible.len();
                state.round_robin = state.round_robin.wrapping_add(1);
                eligible.get(index)
            }
            LoadBalanceStrategy::Random => {
                let index = rand::rng().random_range(0..eligible.len());
                eligible.get(index)
            }
        }
    }

    /// Drop selection state for a service
    pub fn forget(&self, key: &ServiceKey) {
        self.states.remove(key);
    }

    fn smooth_weighted<'a>(
        &self,
        key: &ServiceKey,
        eligible: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        let total = total_weight(eligible);
        if total == 0 {
            return eligible.first();
        }

        let mut state = self.states.entry(key.clone()).or_default();
        state
            .current_weights
            .retain(|id, _| eligible.iter().any(|i| &i.service_instance_id == id));

        let mut best: Option<(usize, i64)> = None;
        for (index, instance) in eligible.iter().enumerate() {
            let weight = i64::from(instance.weight_value.max(0));
            let current = state
                .current_weights
                .entry(instance.service_instance_id.clone())
                .or_insert(0);
            *current += weight;
            // Strict comparison keeps the earliest instance on ties
            if weight > 0 && best.is_none_or(|(_, value)| *current > value) {
                best = Some((index, *current));
            }
        }

        let (index, _) = best?;
        let chosen = &eligible[index];
        if let Some(current) = state.current_weights.get_mut(&chosen.service_instance_id) {
            *current -= i64::try_from(total).unwrap_or(i64::MAX);
        }
        Some(chosen)
    }
}

fn total_weight(instances: &[ServiceInstance]) -> u64 {
    instances
        .iter()
        .map(|i| u64::try_from(i.weight_value).unwrap_or(0))
        .sum()
}

/// Walk instances accumulating weight until `offset` falls inside one.
/// Zero-weight instances own an empty range and are never returned.
fn pick_by_offset(instances: &[ServiceInstance], offset: u64) -> Option<&ServiceInstance> {
    let mut acc = 0u64;
    for instance in instances {
        acc += u64::try_from(instance.weight_value).unwrap_or(0);
        if offset < acc {
            return Some(instance);
        }
    }
    None
}
