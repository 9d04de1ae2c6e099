//! Summary statistics over an aligned metric

use serde::Serialize;

use super::align::{round2, AlignedPoint};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SeriesStats {
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    /// Last non-null value in time order.
    pub latest: f64,
}

/// Stats over the non-null values of `metric`. No values gives all zeros.
pub fn stats(points: &[AlignedPoint], metric: &str) -> SeriesStats {
    let values: Vec<f64> = points.iter().filter_map(|p| p.value(metric)).collect();
    let Some(&latest) = values.last() else {
        return SeriesStats::default();
    };

    let sum: f64 = values.iter().sum();
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);

    SeriesStats {
        avg: round2(sum / values.len() as f64),
        max: round2(max),
        min: round2(min),
        latest: round2(latest),
    }
}
