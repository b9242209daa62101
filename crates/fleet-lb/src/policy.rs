//! Replica selection policies.
//!
//! A policy holds the ready replica set last reported by the controller
//! and picks one URL per forward attempt. Selection is lock-free on the
//! hot path apart from a read lock on the replica list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fleet_core::LoadBalancingPolicyId;
use tracing::info;

/// Picks the replica for each forward attempt.
pub trait LoadBalancingPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replace the ready set.
    fn set_ready_replicas(&self, urls: Vec<String>);

    fn ready_replicas(&self) -> Vec<String>;

    /// Choose a replica not in `exclude`. `None` if none is left.
    fn select(&self, exclude: &[String]) -> Option<String>;

    /// A forward to `url` started.
    fn request_started(&self, _url: &str) {}

    /// A forward to `url` finished, successfully or not.
    fn request_finished(&self, _url: &str) {}
}

/// Build the policy a service asked for.
pub fn policy_for(id: LoadBalancingPolicyId) -> Arc<dyn LoadBalancingPolicy> {
    match id {
        LoadBalancingPolicyId::RoundRobin => Arc::new(RoundRobin::new()),
        LoadBalancingPolicyId::LeastLoad => Arc::new(LeastLoad::new()),
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn replace(lock: &RwLock<Vec<String>>, urls: Vec<String>, policy: &str) {
    let mut current = lock.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if *current != urls {
        info!(policy, replicas = ?urls, "ready replicas updated");
        *current = urls;
    }
}

// ── Round robin ──────────────────────────────────────────────────

/// Cycles through the ready replicas with an atomic counter.
///
/// The counter wraps around whatever the set's current size is, so a
/// growing or shrinking set needs no reset.
pub struct RoundRobin {
    counter: AtomicUsize,
    replicas: RwLock<Vec<String>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            replicas: RwLock::new(Vec::new()),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn set_ready_replicas(&self, urls: Vec<String>) {
        replace(&self.replicas, urls, self.name());
    }

    fn ready_replicas(&self) -> Vec<String> {
        read(&self.replicas)
    }

    fn select(&self, exclude: &[String]) -> Option<String> {
        let replicas = self.replicas.read().unwrap_or_else(|p| p.into_inner());
        let candidates: Vec<&String> = replicas.iter().filter(|u| !exclude.contains(*u)).collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(candidates[idx % candidates.len()].clone())
    }
}

// ── Least load ───────────────────────────────────────────────────

/// Sends each request to the replica with the fewest forwards in flight.
/// Ties go to the earliest replica in the ready set.
pub struct LeastLoad {
    replicas: RwLock<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
}

impl LeastLoad {
    pub fn new() -> Self {
        Self {
            replicas: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn load_of(&self, url: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for LeastLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for LeastLoad {
    fn name(&self) -> &'static str {
        "least_load"
    }

    fn set_ready_replicas(&self, urls: Vec<String>) {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|url, count| *count > 0 || urls.contains(url));
        replace(&self.replicas, urls, self.name());
    }

    fn ready_replicas(&self) -> Vec<String> {
        read(&self.replicas)
    }

    fn select(&self, exclude: &[String]) -> Option<String> {
        let replicas = self.replicas.read().unwrap_or_else(|p| p.into_inner());
        replicas
            .iter()
            .filter(|u| !exclude.contains(*u))
            .min_by_key(|u| self.load_of(u))
            .cloned()
    }

    fn request_started(&self, url: &str) {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(url.to_string())
            .or_insert(0) += 1;
    }

    fn request_finished(&self, url: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(count) = in_flight.get_mut(url) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("http://10.0.0.{i}:8080")).collect()
    }

    #[test]
    fn round_robin_cycles_through_replicas() {
        let lb = RoundRobin::new();
        lb.set_ready_replicas(urls(3));

        let picks: Vec<_> = (0..4).map(|_| lb.select(&[]).unwrap()).collect();
        assert_eq!(picks[0], "http://10.0.0.1:8080");
        assert_eq!(picks[1], "http://10.0.0.2:8080");
        assert_eq!(picks[2], "http://10.0.0.3:8080");
        assert_eq!(picks[3], "http://10.0.0.1:8080"); // wraps
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert_eq!(RoundRobin::new().select(&[]), None);
        assert_eq!(LeastLoad::new().select(&[]), None);
    }

    #[test]
    fn excluded_replicas_are_skipped() {
        let lb = RoundRobin::new();
        lb.set_ready_replicas(urls(2));
        let tried = vec!["http://10.0.0.1:8080".to_string()];
        for _ in 0..5 {
            assert_eq!(lb.select(&tried).unwrap(), "http://10.0.0.2:8080");
        }
        assert_eq!(lb.select(&urls(2)), None);
    }

    #[test]
    fn round_robin_adapts_to_changing_set() {
        let lb = RoundRobin::new();
        lb.set_ready_replicas(urls(2));
        lb.select(&[]);
        lb.set_ready_replicas(urls(1));
        assert_eq!(lb.select(&[]).unwrap(), "http://10.0.0.1:8080");
    }

    #[test]
    fn least_load_prefers_idle_replica() {
        let lb = LeastLoad::new();
        lb.set_ready_replicas(urls(3));

        let first = lb.select(&[]).unwrap();
        assert_eq!(first, "http://10.0.0.1:8080");
        lb.request_started(&first);

        let second = lb.select(&[]).unwrap();
        assert_eq!(second, "http://10.0.0.2:8080");
        lb.request_started(&second);

        lb.request_finished(&first);
        assert_eq!(lb.select(&[]).unwrap(), "http://10.0.0.1:8080");
    }

    #[test]
    fn policy_ids_map_to_policies() {
        assert_eq!(policy_for(LoadBalancingPolicyId::RoundRobin).name(), "round_robin");
        assert_eq!(policy_for(LoadBalancingPolicyId::LeastLoad).name(), "least_load");
    }

    #[test]
    fn round_robin_concurrent_safety() {
        use std::thread;

        let lb = Arc::new(RoundRobin::new());
        lb.set_ready_replicas(urls(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lb = Arc::clone(&lb);
                thread::spawn(move || (0..100).map(|_| lb.select(&[]).unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for url in h.join().unwrap() {
                *counts.entry(url).or_default() += 1;
            }
        }
        // 400 selections spread evenly over 4 replicas.
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 100));
    }
}
