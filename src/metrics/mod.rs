//! Metrics attached to units.
//!
//! Each unit owns a `MetricRegistry`. Lookup-or-create runs under one short
//! lock so two threads reporting the same name share one metric instance.

pub mod running;

pub use running::{Aggregation, Metric};

use crate::error::{Result, UnitError};
use parking_lot::Mutex;
use std::sync::Arc;

pub type SharedMetric = Arc<Mutex<Metric>>;

#[derive(Default)]
pub struct MetricRegistry {
    metrics: Mutex<Vec<SharedMetric>>,
}

impl MetricRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the metric called `name`, creating it on first use.
    /// Reusing a name with a different aggregation is a state error.
    pub fn get_or_create(
        &self,
        unit: &str,
        name: &str,
        aggregation: Aggregation,
    ) -> Result<SharedMetric> {
        let mut metrics = self.metrics.lock();
        if let Some(existing) = metrics.iter().find(|m| m.lock().name() == name) {
            let found = existing.lock().aggregation();
            if found != aggregation {
                return Err(UnitError::state(
                    unit,
                    format!(
                        "metric '{}' already exists with aggregation {:?}, requested {:?}",
                        name, found, aggregation
                    ),
                ));
            }
            return Ok(existing.clone());
        }
        let metric = Arc::new(Mutex::new(Metric::new(name, aggregation)));
        metrics.push(metric.clone());
        Ok(metric)
    }

    /// The metric called `name`, if one was created.
    pub fn get(&self, name: &str) -> Option<SharedMetric> {
        self.metrics
            .lock()
            .iter()
            .find(|m| m.lock().name() == name)
            .cloned()
    }

    /// Every registered metric, in creation order.
    pub fn all(&self) -> Vec<SharedMetric> {
        self.metrics.lock().clone()
    }

    /// Names of the registered metrics, in creation order.
    pub fn names(&self) -> Vec<String> {
        self.metrics
            .lock()
            .iter()
            .map(|m| m.lock().name().to_string())
            .collect()
    }

    /// Resets the running state of every metric.
    pub fn reset_all(&self) {
        for m in self.metrics.lock().iter() {
            m.lock().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_concurrent_lookup_creates_one_metric() {
        let registry = Arc::new(MetricRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        let m = registry
                            .get_or_create("dense", "activity", Aggregation::Sum)
                            .unwrap();
                        m.lock().update(1.0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.names(), vec!["activity".to_string()]);
        let metric = registry.get("activity").unwrap();
        assert_eq!(metric.lock().count(), 800);
    }

    #[test]
    fn test_aggregation_conflict() {
        let registry = MetricRegistry::new();
        registry
            .get_or_create("dense", "loss", Aggregation::Mean)
            .unwrap();
        let err = registry
            .get_or_create("dense", "loss", Aggregation::Sum)
            .unwrap_err();
        assert!(err.is_state());
    }
}
