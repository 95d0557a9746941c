//! Per-resource breaker registry (spec §4.7: "keyed by, e.g., account id,
//! window-name, external API"), grounded in the teacher's pattern of
//! wrapping the canonical breaker per extraction pool
//! (`riptide_reliability::circuit_breaker_pool`) but generalized to an
//! arbitrary string key via `dashmap` instead of one breaker per pool.

use crate::circuit_breaker::{BreakerConfig, CircuitBreaker, RealClock};
use dashmap::DashMap;
use std::sync::Arc;

pub struct BreakerRegistry {
    cfg: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(cfg: BreakerConfig) -> Self {
        Self {
            cfg,
            breakers: DashMap::new(),
        }
    }

    /// Get or lazily create the breaker for `resource_id`.
    pub fn get(&self, resource_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(resource_id) {
            return existing.clone();
        }
        let created = CircuitBreaker::new(self.cfg.clone(), Arc::new(RealClock));
        self.breakers.insert(resource_id.to_string(), created.clone());
        created
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::State;

    #[test]
    fn distinct_keys_get_distinct_breakers() {
        let reg = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        });

        let a = reg.get("account-a");
        let b = reg.get("account-b");

        a.try_acquire().unwrap();
        a.on_failure();
        assert_eq!(a.state(), State::Open);
        assert_eq!(b.state(), State::Closed);
    }

    #[test]
    fn same_key_returns_same_breaker() {
        let reg = BreakerRegistry::new(BreakerConfig::default());
        let a1 = reg.get("window-1");
        let a2 = reg.get("window-1");
        assert!(Arc::ptr_eq(&a1, &a2));
    }
}
