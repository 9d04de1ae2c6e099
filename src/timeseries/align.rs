//! Cross-source time-series alignment
//!
//! Merges the raw per-district series of both source kinds onto one
//! bucketed timeline and averages every metric per bucket. Pure and
//! deterministic: identical input yields identical, identically ordered output.

use chrono::{FixedOffset, Offset, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{DistrictSeries, Timestamp};
use crate::topics::{SourceKind, ALL_SCOPES};

/// `{scope: {kind: series}}`, the aligner's input.
pub type ScopedSeries = BTreeMap<String, BTreeMap<SourceKind, DistrictSeries>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeSelection {
    All,
    /// Fuzzy single-scope filter; see [`select_scopes`].
    Named(String),
}

impl ScopeSelection {
    /// Blank input and the `all` sentinel select every scope.
    pub fn parse(term: &str) -> Self {
        let trimmed = term.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ALL_SCOPES) {
            ScopeSelection::All
        } else {
            ScopeSelection::Named(trimmed.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketRounding {
    /// Nearest multiple of the grain, halves rounding up.
    #[default]
    Nearest,
    /// Start of the grain-wide window containing the sample.
    Floor,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlignOptions {
    pub grain_ms: i64,
    pub rounding: BucketRounding,
    /// Offset applied when rendering `display_label`; buckets stay in UTC.
    pub label_offset: FixedOffset,
    pub label_format: String,
}

impl AlignOptions {
    pub fn new(grain_ms: i64) -> Self {
        Self {
            grain_ms: grain_ms.max(1),
            rounding: BucketRounding::default(),
            label_offset: Utc.fix(),
            label_format: "%d/%m %H:%M".to_string(),
        }
    }

    pub fn with_rounding(mut self, rounding: BucketRounding) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn with_label_offset(mut self, offset: FixedOffset) -> Self {
        self.label_offset = offset;
        self
    }
}

impl Default for AlignOptions {
    fn default() -> Self {
        Self::new(120_000)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignedPoint {
    /// Bucket boundary.
    pub timestamp: Timestamp,
    pub display_label: String,
    pub metric_values: BTreeMap<String, Option<f64>>,
}

impl AlignedPoint {
    pub fn value(&self, metric: &str) -> Option<f64> {
        self.metric_values.get(metric).copied().flatten()
    }
}

/// Lowercased with all whitespace removed.
pub fn normalize_scope(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

/// Scopes to include. A named filter picks the first scope (in key order)
/// whose normalized name contains the normalized term or is contained by it.
pub fn select_scopes<'a>(input: &'a ScopedSeries, selection: &ScopeSelection) -> Vec<&'a str> {
    match selection {
        ScopeSelection::All => input.keys().map(String::as_str).collect(),
        ScopeSelection::Named(term) => {
            let term = normalize_scope(term);
            if term.is_empty() {
                return Vec::new();
            }
            input
                .keys()
                .find(|scope| {
                    let name = normalize_scope(scope);
                    !name.is_empty() && (name.contains(&term) || term.contains(&name))
                })
                .map(|scope| vec![scope.as_str()])
                .unwrap_or_default()
        }
    }
}

pub fn bucket_of(ts_ms: i64, grain_ms: i64, rounding: BucketRounding) -> i64 {
    let grain = grain_ms.max(1);
    match rounding {
        BucketRounding::Nearest => (ts_ms + grain / 2).div_euclid(grain) * grain,
        BucketRounding::Floor => ts_ms.div_euclid(grain) * grain,
    }
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(round2(values.iter().sum::<f64>() / values.len() as f64))
}

#[derive(Debug, Clone, Default)]
pub struct TimeSeriesAligner {
    options: AlignOptions,
}

impl TimeSeriesAligner {
    pub fn new(options: AlignOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AlignOptions {
        &self.options
    }

    /// One point per distinct bucket across every selected scope and kind,
    /// carrying the mean of every tracked metric (`None` when no sample).
    pub fn align(&self, input: &ScopedSeries, selection: &ScopeSelection) -> Vec<AlignedPoint> {
        let scopes = select_scopes(input, selection);

        let mut tracked: BTreeSet<&str> = BTreeSet::new();
        let mut buckets: BTreeMap<i64, BTreeMap<&str, Vec<f64>>> = BTreeMap::new();

        for scope in scopes {
            let Some(kinds) = input.get(scope) else { continue };
            for series in kinds.values() {
                for attr in &series.attributes {
                    tracked.insert(attr.attr_name.as_str());
                }
                for (i, ts) in series.index.iter().enumerate() {
                    let bucket = bucket_of(ts.timestamp_millis(), self.options.grain_ms, self.options.rounding);
                    let samples = buckets.entry(bucket).or_default();
                    for attr in &series.attributes {
                        if let Some(Some(v)) = attr.values.get(i) {
                            if !v.is_nan() {
                                samples.entry(attr.attr_name.as_str()).or_default().push(*v);
                            }
                        }
                    }
                }
            }
        }

        buckets
            .into_iter()
            .filter_map(|(bucket, samples)| {
                let timestamp = Utc.timestamp_millis_opt(bucket).single()?;
                let metric_values = tracked
                    .iter()
                    .map(|m| (m.to_string(), samples.get(m).and_then(|v| mean(v))))
                    .collect();
                Some(AlignedPoint {
                    timestamp,
                    display_label: self.label(&timestamp),
                    metric_values,
                })
            })
            .collect()
    }

    /// [`align`](Self::align), keeping only buckets with a value for `metric`.
    pub fn align_metric(&self, input: &ScopedSeries, selection: &ScopeSelection, metric: &str) -> Vec<AlignedPoint> {
        for_metric(self.align(input, selection), metric)
    }

    fn label(&self, ts: &Timestamp) -> String {
        ts.with_timezone(&self.options.label_offset)
            .format(&self.options.label_format)
            .to_string()
    }
}

/// Drop buckets whose value for `metric` is null.
pub fn for_metric(points: Vec<AlignedPoint>, metric: &str) -> Vec<AlignedPoint> {
    points.into_iter().filter(|p| p.value(metric).is_some()).collect()
}

/// Aligned series for one metric at `grain_ms`, with default rounding.
pub fn align(input: &ScopedSeries, selection: &ScopeSelection, metric: &str, grain_ms: i64) -> Vec<AlignedPoint> {
    TimeSeriesAligner::new(AlignOptions::new(grain_ms)).align_metric(input, selection, metric)
}

/// Build the aligner input from one history map per kind. A scope present
/// in only one map contributes just that kind.
pub fn combine_history(sources: &[(SourceKind, &BTreeMap<String, DistrictSeries>)]) -> ScopedSeries {
    let mut combined = ScopedSeries::new();
    for (kind, map) in sources {
        for (scope, series) in map.iter() {
            combined.entry(scope.clone()).or_default().insert(*kind, series.clone());
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SeriesAttribute;
    use chrono::Duration;

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 11, 1, 0, 0, 0).unwrap()
    }

    fn series(offsets_s: &[i64], attrs: &[(&str, &[Option<f64>])]) -> DistrictSeries {
        DistrictSeries {
            index: offsets_s.iter().map(|s| t0() + Duration::seconds(*s)).collect(),
            attributes: attrs
                .iter()
                .map(|(name, values)| SeriesAttribute { attr_name: name.to_string(), values: values.to_vec() })
                .collect(),
        }
    }

    fn scoped(entries: Vec<(&str, SourceKind, DistrictSeries)>) -> ScopedSeries {
        let mut input = ScopedSeries::new();
        for (scope, kind, s) in entries {
            input.entry(scope.to_string()).or_default().insert(kind, s);
        }
        input
    }

    #[test]
    fn test_window_bucketing_merges_samples() {
        let input = scoped(vec![(
            "PhuongHoanKiem",
            SourceKind::Weather,
            series(&[5, 95], &[("temperature", &[Some(10.0), Some(12.0)])]),
        )]);
        let aligner = TimeSeriesAligner::new(AlignOptions::new(120_000).with_rounding(BucketRounding::Floor));
        let points = aligner.align(&input, &ScopeSelection::All);

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].timestamp, t0());
        assert_eq!(points[0].value("temperature"), Some(11.0));
    }

    #[test]
    fn test_nearest_rounding_half_up() {
        let grain = 120_000;
        let base = t0().timestamp_millis();
        assert_eq!(bucket_of(base + 5_000, grain, BucketRounding::Nearest), base);
        assert_eq!(bucket_of(base + 59_999, grain, BucketRounding::Nearest), base);
        assert_eq!(bucket_of(base + 60_000, grain, BucketRounding::Nearest), base + grain);
        assert_eq!(bucket_of(base + 95_000, grain, BucketRounding::Nearest), base + grain);
        assert_eq!(bucket_of(base + grain, grain, BucketRounding::Nearest), base + grain);
        assert_eq!(bucket_of(base + grain, grain, BucketRounding::Floor), base + grain);
    }

    #[test]
    fn test_multi_scope_multi_kind_average() {
        let input = scoped(vec![
            ("BaDinh", SourceKind::Weather, series(&[0, 120], &[("temperature", &[Some(20.0), Some(22.0)])])),
            ("HoanKiem", SourceKind::Weather, series(&[10], &[("temperature", &[Some(30.0)])])),
            ("HoanKiem", SourceKind::AirQuality, series(&[0], &[("pm2_5", &[Some(40.5)])])),
        ]);
        let points = TimeSeriesAligner::default().align(&input, &ScopeSelection::All);

        assert_eq!(points.len(), 2);
        assert_eq!(points[0].value("temperature"), Some(25.0));
        assert_eq!(points[0].value("pm2_5"), Some(40.5));
        assert_eq!(points[1].value("temperature"), Some(22.0));
        assert_eq!(points[1].value("pm2_5"), None);
        assert!(points[1].metric_values.contains_key("pm2_5"));
    }

    #[test]
    fn test_null_filtering_per_metric() {
        let input = scoped(vec![
            ("A", SourceKind::Weather, series(&[0, 600], &[("humidity", &[Some(0.7), Some(0.8)])])),
            ("A", SourceKind::AirQuality, series(&[600], &[("pm10", &[Some(55.0)])])),
        ]);
        let aligner = TimeSeriesAligner::default();

        let all = aligner.align(&input, &ScopeSelection::All);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value("pm10"), None);

        let pm10 = aligner.align_metric(&input, &ScopeSelection::All, "pm10");
        assert_eq!(pm10.len(), 1);
        assert_eq!(pm10[0].timestamp, t0() + Duration::seconds(600));

        let humidity = aligner.align_metric(&input, &ScopeSelection::All, "humidity");
        assert_eq!(humidity.len(), 2);
    }

    #[test]
    fn test_nan_and_null_ignored_in_mean() {
        let input = scoped(vec![(
            "A",
            SourceKind::AirQuality,
            series(&[0, 1, 2], &[("o3", &[Some(f64::NAN), None, Some(3.333)])]),
        )]);
        let points = TimeSeriesAligner::default().align(&input, &ScopeSelection::All);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value("o3"), Some(3.33));
    }

    #[test]
    fn test_named_scope_matching() {
        let input = scoped(vec![
            ("Phuong Ba Dinh", SourceKind::Weather, series(&[0], &[("temperature", &[Some(1.0)])])),
            ("PhuongHoanKiem", SourceKind::Weather, series(&[0], &[("temperature", &[Some(9.0)])])),
        ]);

        assert_eq!(select_scopes(&input, &ScopeSelection::parse("hoan kiem")), vec!["PhuongHoanKiem"]);
        assert_eq!(select_scopes(&input, &ScopeSelection::parse("BADINH")), vec!["Phuong Ba Dinh"]);
        // Term containing the scope name also matches.
        assert_eq!(
            select_scopes(&input, &ScopeSelection::parse("Quan PhuongHoanKiem Ha Noi")),
            vec!["PhuongHoanKiem"]
        );
        assert!(select_scopes(&input, &ScopeSelection::parse("Cau Giay")).is_empty());
        assert_eq!(select_scopes(&input, &ScopeSelection::parse("All")).len(), 2);

        let points = align(&input, &ScopeSelection::parse("Cau Giay"), "temperature", 120_000);
        assert!(points.is_empty());
    }

    #[test]
    fn test_unsorted_index_and_empty_scope() {
        let input = scoped(vec![
            ("A", SourceKind::Weather, series(&[3600, 0, 1800], &[("temperature", &[Some(3.0), Some(1.0), Some(2.0)])])),
            ("Empty", SourceKind::Weather, DistrictSeries::default()),
        ]);
        let points = TimeSeriesAligner::default().align(&input, &ScopeSelection::All);
        let values: Vec<_> = points.iter().map(|p| p.value("temperature").unwrap()).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn test_alignment_is_deterministic() {
        let input = scoped(vec![
            ("A", SourceKind::Weather, series(&[0, 130, 260], &[("temperature", &[Some(1.0), Some(2.0), None])])),
            ("B", SourceKind::AirQuality, series(&[10, 250], &[("pm2_5", &[Some(5.0), Some(7.0)])])),
        ]);
        let first = align(&input, &ScopeSelection::All, "pm2_5", 120_000);
        let second = align(&input, &ScopeSelection::All, "pm2_5", 120_000);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_display_label_uses_offset() {
        let input = scoped(vec![("A", SourceKind::Weather, series(&[0], &[("temperature", &[Some(1.0)])]))]);
        let hanoi = FixedOffset::east_opt(7 * 3600).unwrap();
        let aligner = TimeSeriesAligner::new(AlignOptions::new(120_000).with_label_offset(hanoi));
        let points = aligner.align(&input, &ScopeSelection::All);
        assert_eq!(points[0].display_label, "01/11 07:00");
        assert_eq!(points[0].timestamp, t0());
    }

    #[test]
    fn test_combine_history_tolerates_asymmetry() {
        let weather = BTreeMap::from([
            ("A".to_string(), series(&[0], &[("temperature", &[Some(1.0)])])),
            ("B".to_string(), series(&[0], &[("temperature", &[Some(2.0)])])),
        ]);
        let air = BTreeMap::from([("B".to_string(), series(&[0], &[("pm10", &[Some(3.0)])]))]);

        let combined = combine_history(&[(SourceKind::Weather, &weather), (SourceKind::AirQuality, &air)]);
        assert_eq!(combined["A"].len(), 1);
        assert_eq!(combined["B"].len(), 2);
    }
}
