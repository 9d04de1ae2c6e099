//! Time-series alignment and statistics for district history charts

pub mod align;
pub mod stats;

pub use align::{
    align, bucket_of, combine_history, for_metric, normalize_scope, select_scopes, AlignOptions, AlignedPoint,
    BucketRounding, ScopeSelection, ScopedSeries, TimeSeriesAligner,
};
pub use stats::{stats, SeriesStats};
