//! Per-stage wall-clock accounting for the correction pipeline.

use serde::{Deserialize, Serialize};

/// Milliseconds spent in each pipeline stage, accumulated over one or more
/// correction runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionTimings {
    /// Correspondence search (ray casting against the map).
    pub raycast_ms: f64,
    /// Statistics reduction.
    pub reduction_ms: f64,
    /// SVD solve.
    pub solve_ms: f64,
}

impl CorrectionTimings {
    pub fn total_ms(&self) -> f64 {
        self.raycast_ms + self.reduction_ms + self.solve_ms
    }

    pub fn accumulate(&mut self, other: &CorrectionTimings) {
        self.raycast_ms += other.raycast_ms;
        self.reduction_ms += other.reduction_ms;
        self.solve_ms += other.solve_ms;
    }

    /// Average over `runs` accumulated repetitions.
    pub fn per_run(&self, runs: u32) -> CorrectionTimings {
        let inv = 1.0 / f64::from(runs.max(1));
        CorrectionTimings {
            raycast_ms: self.raycast_ms * inv,
            reduction_ms: self.reduction_ms * inv,
            solve_ms: self.solve_ms * inv,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn accumulate_and_average() {
        let mut total = CorrectionTimings::default();
        for _ in 0..4 {
            total.accumulate(&CorrectionTimings {
                raycast_ms: 2.0,
                reduction_ms: 1.0,
                solve_ms: 0.5,
            });
        }
        assert_relative_eq!(total.total_ms(), 14.0);

        let avg = total.per_run(4);
        assert_relative_eq!(avg.raycast_ms, 2.0);
        assert_relative_eq!(avg.total_ms(), 3.5);
    }
}
