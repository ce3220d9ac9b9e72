//! Streaming metric accumulators.
//!
//! Values are folded in one update at a time, so nothing but the running
//! state is stored.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Mean,
    Sum,
}

/// A named metric reported by a unit.
#[derive(Debug, Clone)]
pub struct Metric {
    name: String,
    aggregation: Aggregation,
    mean: f64,
    total: f64,
    count: usize,
}

impl Metric {
    pub fn new(name: &str, aggregation: Aggregation) -> Self {
        Self {
            name: name.to_string(),
            aggregation,
            mean: 0.0,
            total: 0.0,
            count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    pub fn update(&mut self, value: f64) {
        self.count += 1;
        self.total += value;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
    }

    pub fn update_batch(&mut self, values: &[f64]) {
        for &v in values {
            self.update(v);
        }
    }

    pub fn result(&self) -> f64 {
        match self.aggregation {
            Aggregation::Mean => self.mean,
            Aggregation::Sum => self.total,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.total = 0.0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_mean_and_sum() {
        let mut mean = Metric::new("acc", Aggregation::Mean);
        mean.update_batch(&[1.0, 2.0, 3.0, 4.0]);
        assert_abs_diff_eq!(mean.result(), 2.5);

        let mut sum = Metric::new("count", Aggregation::Sum);
        sum.update_batch(&[1.0, 2.0, 3.0, 4.0]);
        assert_abs_diff_eq!(sum.result(), 10.0);

        sum.reset();
        assert_eq!(sum.count(), 0);
        assert_abs_diff_eq!(sum.result(), 0.0);
    }
}
