use serde::{Deserialize, Serialize};

/// Order-statistic selection rule.
///
/// | Method               | Position (0-based) for rank `p` over `n` values          |
/// |----------------------|-----------------------------------------------------------|
/// | `Linear`             | `h = (n-1)p`, interpolate between `x[floor h]` and next   |
/// | `ClosestObservation` | `n·p - 1.5`, round up; round down on exact odd boundaries |
///
/// `Linear` matches Excel `PERCENTILE.INC` and numpy's default;
/// `ClosestObservation` matches numpy's `closest_observation`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PercentileMethod {
    #[default]
    Linear,
    ClosestObservation,
}

/// Percentile of an ascending, non-empty slice. `rank` is in `[0, 100]`.
pub fn percentile(sorted: &[f32], rank: f64, method: PercentileMethod) -> f64 {
    debug_assert!(!sorted.is_empty());
    let n = sorted.len();
    let p = (rank / 100.0).clamp(0.0, 1.0);

    match method {
        PercentileMethod::Linear => {
            let h = (n - 1) as f64 * p;
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            let (a, b) = (sorted[lo] as f64, sorted[hi] as f64);
            (a + (h - lo as f64) * (b - a)).clamp(a, b)
        }
        PercentileMethod::ClosestObservation => {
            let index = n as f64 * p - 1.5;
            let previous = index.floor();
            let gamma = index - previous;
            let odd = (previous as i64).rem_euclid(2) == 1;
            let chosen = if gamma == 0.0 && odd {
                previous
            } else {
                previous + 1.0
            };
            sorted[chosen.clamp(0.0, (n - 1) as f64) as usize] as f64
        }
    }
}
