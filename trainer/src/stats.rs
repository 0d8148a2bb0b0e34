use std::fmt;

/// Running (samples, cost) totals with a resettable current window for
/// the periodic `Batch=` log lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrainerStats {
    total_samples: usize,
    total_cost: f64,
    current_samples: usize,
    current_cost: f64,
}

impl TrainerStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn reset_current(&mut self) {
        self.current_samples = 0;
        self.current_cost = 0.0;
    }

    pub fn add(&mut self, samples: usize, cost: f64) {
        self.total_samples += samples;
        self.total_cost += cost;
        self.current_samples += samples;
        self.current_cost += cost;
    }

    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn avg_cost(&self) -> f64 {
        if self.total_samples == 0 {
            0.0
        } else {
            self.total_cost / self.total_samples as f64
        }
    }

    pub fn current_avg_cost(&self) -> f64 {
        if self.current_samples == 0 {
            0.0
        } else {
            self.current_cost / self.current_samples as f64
        }
    }
}

impl fmt::Display for TrainerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples={} AvgCost={:.5} CurrentCost={:.5}",
            self.total_samples,
            self.avg_cost(),
            self.current_avg_cost()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_window_resets_independently() {
        let mut stats = TrainerStats::default();
        stats.add(10, 20.0);
        stats.reset_current();
        stats.add(10, 10.0);

        assert_eq!(stats.total_samples(), 20);
        assert_eq!(stats.avg_cost(), 1.5);
        assert_eq!(stats.current_avg_cost(), 1.0);
        assert_eq!(
            stats.to_string(),
            "samples=20 AvgCost=1.50000 CurrentCost=1.00000"
        );
    }
}
