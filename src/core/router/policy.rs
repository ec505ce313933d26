// src/core/router/policy.rs

//! Destination selection strategies over a candidate set.

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// The configured strategy for picking one handler out of the candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingPolicy {
    #[default]
    RoundRobin,
    Random,
    FirstAvailable,
    /// Stand-in for round-robin until per-handler load metrics exist.
    LoadBalanced,
}

/// Stateful selector: a per-trigger cursor for round-robin and a small RNG
/// for the random policy. Ties always break by insertion order because the
/// candidate list preserves registration order.
#[derive(Debug)]
pub struct DestinationSelector {
    cursors: DashMap<String, AtomicUsize>,
    rng: Mutex<SmallRng>,
}

impl Default for DestinationSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationSelector {
    pub fn new() -> Self {
        Self {
            cursors: DashMap::new(),
            rng: Mutex::new(SmallRng::from_entropy()),
        }
    }

    /// Picks one candidate index. `candidates` must be non-empty.
    pub fn select(&self, policy: RoutingPolicy, trigger: &str, candidates: usize) -> usize {
        debug_assert!(candidates > 0);
        match policy {
            RoutingPolicy::RoundRobin | RoutingPolicy::LoadBalanced => {
                let cursor = self
                    .cursors
                    .entry(trigger.to_string())
                    .or_insert_with(|| AtomicUsize::new(0));
                cursor.fetch_add(1, Ordering::Relaxed) % candidates
            }
            RoutingPolicy::Random => self.rng.lock().gen_range(0..candidates),
            RoutingPolicy::FirstAvailable => 0,
        }
    }
}
