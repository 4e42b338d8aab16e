// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-series counters, gauges and histograms.
//!
//! Each series keeps its current value for scrapes plus a timestamp-ordered history for range
//! queries. Late samples are inserted at their ordered position rather than rejected. The first
//! sample of a series fixes its kind; a sample of another kind is a [`AggregateError::KindConflict`]
//! and leaves the series untouched.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::errors::AggregateError;
use crate::event::{EventKind, TimeRange, Timestamp};
use crate::index::SeriesId;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Fixed-boundary histogram with cumulative bucket counts. The last bucket is `+Inf`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistogramValue {
    pub bounds: Arc<[f64]>,
    pub cumulative: Vec<u64>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramValue {
    pub fn new(bounds: Arc<[f64]>) -> Self {
        let buckets = bounds.len() + 1;
        Self {
            bounds,
            cumulative: vec![0; buckets],
            count: 0,
            sum: 0.0,
        }
    }

    pub fn from_observations(bounds: Arc<[f64]>, observations: &[Sample]) -> Self {
        let mut histogram = Self::new(bounds);
        for sample in observations {
            histogram.observe(sample.value);
        }
        histogram
    }

    pub fn observe(&mut self, value: f64) {
        let first = self.bounds.partition_point(|b| *b < value);
        for bucket in &mut self.cumulative[first..] {
            *bucket += 1;
        }
        self.count += 1;
        self.sum += value;
    }

    /// Estimates the `p` quantile by linear interpolation inside the bucket holding the rank.
    /// Ranks that land in the `+Inf` bucket return the highest finite bound. `None` when empty.
    pub fn quantile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=1.0).contains(&p) {
            return None;
        }
        let rank = p * self.count as f64;
        let bucket = self
            .cumulative
            .iter()
            .position(|c| *c as f64 >= rank)
            .unwrap_or(self.cumulative.len() - 1);

        if bucket == self.bounds.len() {
            return self.bounds.last().copied();
        }
        let upper = self.bounds[bucket];
        let (lower, count_before) = if bucket == 0 {
            if upper <= 0.0 {
                return Some(upper);
            }
            (0.0, 0)
        } else {
            (self.bounds[bucket - 1], self.cumulative[bucket - 1])
        };
        let in_bucket = self.cumulative[bucket] - count_before;
        if in_bucket == 0 {
            return Some(upper);
        }
        Some(lower + (upper - lower) * ((rank - count_before as f64) / in_bucket as f64))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum MetricValue {
    Counter(f64),
    Gauge(f64),
    Histogram(HistogramValue),
}

impl MetricValue {
    pub fn kind(&self) -> EventKind {
        match self {
            MetricValue::Counter(_) => EventKind::Counter,
            MetricValue::Gauge(_) => EventKind::Gauge,
            MetricValue::Histogram(_) => EventKind::Histogram,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotEntry {
    pub series: SeriesId,
    pub value: MetricValue,
}

/// Samples of one series within a time range, in timestamp order.
#[derive(Clone, Debug, PartialEq)]
pub enum SeriesWindow {
    /// Cumulative counter values after each increment or reset.
    Counter(Vec<Sample>),
    Gauge(Vec<Sample>),
    /// Raw observations.
    Histogram {
        bounds: Arc<[f64]>,
        observations: Vec<Sample>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CounterPoint {
    Add(f64),
    Reset,
}

impl CounterPoint {
    fn apply(self, total: f64) -> f64 {
        match self {
            CounterPoint::Add(delta) => total + delta,
            CounterPoint::Reset => 0.0,
        }
    }
}

#[derive(Debug)]
enum SeriesState {
    Counter {
        /// Total carried over from compacted points.
        base: f64,
        /// Points before this instant were folded into `base`.
        compacted_before: Timestamp,
        total: f64,
        points: Vec<(Timestamp, CounterPoint)>,
    },
    Gauge {
        value: f64,
        updated_at: Timestamp,
        samples: Vec<Sample>,
    },
    Histogram {
        current: HistogramValue,
        observations: Vec<Sample>,
    },
}

impl SeriesState {
    fn kind(&self) -> EventKind {
        match self {
            SeriesState::Counter { .. } => EventKind::Counter,
            SeriesState::Gauge { .. } => EventKind::Gauge,
            SeriesState::Histogram { .. } => EventKind::Histogram,
        }
    }

    fn current(&self) -> MetricValue {
        match self {
            SeriesState::Counter { total, .. } => MetricValue::Counter(*total),
            SeriesState::Gauge { value, .. } => MetricValue::Gauge(*value),
            SeriesState::Histogram { current, .. } => MetricValue::Histogram(current.clone()),
        }
    }
}

/// Inserts after any entries with the same timestamp, so ties keep arrival order.
fn insert_ordered<T>(items: &mut Vec<T>, item: T, timestamp: Timestamp, ts: impl Fn(&T) -> Timestamp) -> bool {
    let position = items.partition_point(|existing| ts(existing) <= timestamp);
    let at_end = position == items.len();
    items.insert(position, item);
    at_end
}

fn in_range<T: Clone>(items: &[T], range: TimeRange, ts: impl Fn(&T) -> Timestamp) -> Vec<T> {
    let lo = items.partition_point(|i| ts(i) < range.start);
    let hi = items.partition_point(|i| ts(i) <= range.end);
    items[lo..hi.max(lo)].to_vec()
}

pub struct MetricAggregator {
    series: RwLock<BTreeMap<SeriesId, SeriesState>>,
    bounds: Arc<[f64]>,
}

impl MetricAggregator {
    /// `bounds` must be finite and strictly increasing; see
    /// [`crate::pipeline::PipelineConfig::validate`].
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            series: RwLock::new(BTreeMap::new()),
            bounds: Arc::from(bounds),
        }
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    fn update<F>(
        &self,
        series: SeriesId,
        attempted: EventKind,
        init: impl FnOnce() -> SeriesState,
        f: F,
    ) -> Result<(), AggregateError>
    where
        F: FnOnce(&mut SeriesState),
    {
        #[allow(clippy::expect_used)]
        let mut map = self.series.write().expect("lock poisoned");
        let state = map.entry(series).or_insert_with(init);
        let existing = state.kind();
        if existing != attempted {
            return Err(AggregateError::KindConflict {
                series,
                existing,
                attempted,
            });
        }
        f(state);
        Ok(())
    }

    fn new_counter() -> SeriesState {
        SeriesState::Counter {
            base: 0.0,
            compacted_before: Timestamp::MIN,
            total: 0.0,
            points: Vec::new(),
        }
    }

    fn record_counter(
        &self,
        series: SeriesId,
        timestamp: Timestamp,
        point: CounterPoint,
    ) -> Result<(), AggregateError> {
        let mut late = None;
        self.update(series, EventKind::Counter, Self::new_counter, |state| {
            if let SeriesState::Counter {
                base,
                compacted_before,
                total,
                points,
            } = state
            {
                if timestamp < *compacted_before {
                    late = Some(*compacted_before);
                    return;
                }
                if insert_ordered(points, (timestamp, point), timestamp, |p| p.0) {
                    *total = point.apply(*total);
                } else {
                    *total = points.iter().fold(*base, |acc, (_, p)| p.apply(acc));
                }
            }
        })?;
        match late {
            Some(compacted_before) => Err(AggregateError::SampleBeforeCompaction {
                series,
                timestamp,
                compacted_before,
            }),
            None => Ok(()),
        }
    }

    /// Adds `delta` to a counter. Negative deltas are rejected and leave the counter unchanged.
    pub fn increment(
        &self,
        series: SeriesId,
        timestamp: Timestamp,
        delta: f64,
    ) -> Result<(), AggregateError> {
        if !delta.is_finite() {
            return Err(AggregateError::NonFiniteValue(series));
        }
        if delta < 0.0 {
            return Err(AggregateError::NegativeDeltaOnCounter { series, delta });
        }
        self.record_counter(series, timestamp, CounterPoint::Add(delta))
    }

    /// Records a restart of the producing process: the counter starts over from zero.
    pub fn reset_counter(
        &self,
        series: SeriesId,
        timestamp: Timestamp,
    ) -> Result<(), AggregateError> {
        self.record_counter(series, timestamp, CounterPoint::Reset)
    }

    /// Sets a gauge. The current value is the one with the latest timestamp.
    pub fn set(
        &self,
        series: SeriesId,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<(), AggregateError> {
        if !value.is_finite() {
            return Err(AggregateError::NonFiniteValue(series));
        }
        let init = || SeriesState::Gauge {
            value,
            updated_at: timestamp,
            samples: Vec::new(),
        };
        self.update(series, EventKind::Gauge, init, |state| {
            if let SeriesState::Gauge {
                value: current,
                updated_at,
                samples,
            } = state
            {
                if timestamp >= *updated_at {
                    *current = value;
                    *updated_at = timestamp;
                }
                insert_ordered(samples, Sample { timestamp, value }, timestamp, |s| s.timestamp);
            }
        })
    }

    pub fn observe(
        &self,
        series: SeriesId,
        timestamp: Timestamp,
        value: f64,
    ) -> Result<(), AggregateError> {
        if !value.is_finite() {
            return Err(AggregateError::NonFiniteValue(series));
        }
        let bounds = Arc::clone(&self.bounds);
        let init = || SeriesState::Histogram {
            current: HistogramValue::new(bounds),
            observations: Vec::new(),
        };
        self.update(series, EventKind::Histogram, init, |state| {
            if let SeriesState::Histogram {
                current,
                observations,
            } = state
            {
                current.observe(value);
                insert_ordered(
                    observations,
                    Sample { timestamp, value },
                    timestamp,
                    |s| s.timestamp,
                );
            }
        })
    }

    pub fn kind(&self, series: SeriesId) -> Option<EventKind> {
        #[allow(clippy::expect_used)]
        let map = self.series.read().expect("lock poisoned");
        map.get(&series).map(SeriesState::kind)
    }

    /// Point-in-time copy of every series' current value, in series creation order.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        #[allow(clippy::expect_used)]
        let map = self.series.read().expect("lock poisoned");
        map.iter()
            .map(|(series, state)| SnapshotEntry {
                series: *series,
                value: state.current(),
            })
            .collect()
    }

    pub fn current(&self, series: SeriesId) -> Option<MetricValue> {
        #[allow(clippy::expect_used)]
        let map = self.series.read().expect("lock poisoned");
        map.get(&series).map(SeriesState::current)
    }

    /// Copies the samples of `series` that fall inside `range`.
    pub fn window(&self, series: SeriesId, range: TimeRange) -> Option<SeriesWindow> {
        #[allow(clippy::expect_used)]
        let map = self.series.read().expect("lock poisoned");
        let window = match map.get(&series)? {
            SeriesState::Counter { base, points, .. } => {
                let mut total = *base;
                let mut samples = Vec::new();
                for (timestamp, point) in points {
                    total = point.apply(total);
                    if *timestamp > range.end {
                        break;
                    }
                    if *timestamp >= range.start {
                        samples.push(Sample {
                            timestamp: *timestamp,
                            value: total,
                        });
                    }
                }
                SeriesWindow::Counter(samples)
            }
            SeriesState::Gauge { samples, .. } => {
                SeriesWindow::Gauge(in_range(samples, range, |s| s.timestamp))
            }
            SeriesState::Histogram { observations, .. } => SeriesWindow::Histogram {
                bounds: Arc::clone(&self.bounds),
                observations: in_range(observations, range, |s| s.timestamp),
            },
        };
        Some(window)
    }

    /// Drops history older than `cutoff`. Current values are preserved; counter totals of the
    /// dropped points are folded into the series base, and later counter samples older than
    /// `cutoff` are rejected with [`AggregateError::SampleBeforeCompaction`]. Returns the number
    /// of samples removed.
    pub fn truncate_before(&self, cutoff: Timestamp) -> usize {
        #[allow(clippy::expect_used)]
        let mut map = self.series.write().expect("lock poisoned");
        let mut removed = 0;
        for state in map.values_mut() {
            match state {
                SeriesState::Counter {
                    base,
                    compacted_before,
                    points,
                    ..
                } => {
                    *compacted_before = (*compacted_before).max(cutoff);
                    let split = points.partition_point(|(ts, _)| *ts < cutoff);
                    *base = points[..split]
                        .iter()
                        .fold(*base, |acc, (_, p)| p.apply(acc));
                    points.drain(..split);
                    removed += split;
                }
                SeriesState::Gauge { samples, .. } => {
                    let split = samples.partition_point(|s| s.timestamp < cutoff);
                    samples.drain(..split);
                    removed += split;
                }
                SeriesState::Histogram { observations, .. } => {
                    let split = observations.partition_point(|s| s.timestamp < cutoff);
                    observations.drain(..split);
                    removed += split;
                }
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let map = self.series.read().expect("lock poisoned");
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Increase of a cumulative counter over `samples`, treating any decrease as a counter reset:
/// after a reset only the post-reset value counts as increase.
pub fn counter_increase(samples: &[Sample]) -> f64 {
    samples
        .windows(2)
        .map(|w| {
            if w[1].value >= w[0].value {
                w[1].value - w[0].value
            } else {
                w[1].value
            }
        })
        .sum()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_HISTOGRAM_BUCKETS;
    use crate::index::LabelIndex;
    use crate::labels::LabelSet;

    fn series(index: &LabelIndex, labels: &str) -> SeriesId {
        index.resolve(&LabelSet::parse(labels).unwrap()).unwrap()
    }

    fn aggregator() -> MetricAggregator {
        MetricAggregator::new(&DEFAULT_HISTOGRAM_BUCKETS)
    }

    fn counter_value(aggregator: &MetricAggregator, id: SeriesId) -> f64 {
        match aggregator.current(id).unwrap() {
            MetricValue::Counter(v) => v,
            other => panic!("expected counter, got {other:?}"),
        }
    }

    #[test]
    fn test_counter_increments_monotonic() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let id = series(&index, "__name__:hits");
        let mut last = 0.0;
        for (ts, delta) in [(1, 1.0), (2, 0.0), (3, 2.5), (4, 1.0)] {
            agg.increment(id, ts, delta).unwrap();
            let now = counter_value(&agg, id);
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, 4.5);
    }

    #[test]
    fn test_negative_delta_rejected_without_change() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let id = series(&index, "__name__:hits");
        agg.increment(id, 1, 3.0).unwrap();
        assert_eq!(
            agg.increment(id, 2, -1.0),
            Err(AggregateError::NegativeDeltaOnCounter {
                series: id,
                delta: -1.0
            })
        );
        assert_eq!(counter_value(&agg, id), 3.0);
        assert_eq!(agg.window(id, TimeRange::new(0, 10).unwrap()).unwrap(),
            SeriesWindow::Counter(vec![Sample { timestamp: 1, value: 3.0 }]));
    }

    #[test]
    fn test_kind_conflict() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let id = series(&index, "__name__:latency");
        agg.increment(id, 1, 1.0).unwrap();
        assert_eq!(
            agg.observe(id, 2, 0.3),
            Err(AggregateError::KindConflict {
                series: id,
                existing: EventKind::Counter,
                attempted: EventKind::Histogram,
            })
        );
        assert_eq!(agg.kind(id), Some(EventKind::Counter));
        assert_eq!(counter_value(&agg, id), 1.0);
    }

    #[test]
    fn test_gauge_last_write_wins_by_timestamp() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let id = series(&index, "__name__:cpu");
        agg.set(id, 10, 50.0).unwrap();
        agg.set(id, 5, 99.0).unwrap();
        assert_eq!(agg.current(id), Some(MetricValue::Gauge(50.0)));
        agg.set(id, 11, 20.0).unwrap();
        assert_eq!(agg.current(id), Some(MetricValue::Gauge(20.0)));

        let window = agg.window(id, TimeRange::new(0, 100).unwrap()).unwrap();
        assert_eq!(
            window,
            SeriesWindow::Gauge(vec![
                Sample { timestamp: 5, value: 99.0 },
                Sample { timestamp: 10, value: 50.0 },
                Sample { timestamp: 11, value: 20.0 },
            ])
        );
    }

    #[test]
    fn test_counter_out_of_order_and_reset() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let id = series(&index, "__name__:requests");
        agg.increment(id, 10, 100.0).unwrap();
        agg.increment(id, 30, 30.0).unwrap();
        // reset arrives late, between the two increments
        agg.reset_counter(id, 20).unwrap();
        assert_eq!(counter_value(&agg, id), 30.0);

        let SeriesWindow::Counter(samples) =
            agg.window(id, TimeRange::new(0, 100).unwrap()).unwrap()
        else {
            panic!("expected counter window");
        };
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![100.0, 0.0, 30.0]);
        assert_eq!(counter_increase(&samples), 30.0);
    }

    #[test]
    fn test_counter_increase_handles_reset() {
        let samples = [
            Sample { timestamp: 0, value: 100.0 },
            Sample { timestamp: 1, value: 0.0 },
            Sample { timestamp: 2, value: 30.0 },
        ];
        assert_eq!(counter_increase(&samples), 30.0);
        assert_eq!(counter_increase(&samples[..1]), 0.0);
    }

    #[test]
    fn test_histogram_buckets_and_quantile() {
        let mut histogram = HistogramValue::new(Arc::from(&[1.0, 2.0, 4.0][..]));
        for v in [0.5, 1.5, 1.5, 3.0] {
            histogram.observe(v);
        }
        assert_eq!(histogram.cumulative, vec![1, 3, 4, 4]);
        assert_eq!(histogram.count, 4);
        assert_eq!(histogram.sum, 6.5);
        // rank 2 lands in (1, 2], one of two observations in that bucket
        assert_eq!(histogram.quantile(0.5), Some(1.5));
        assert_eq!(histogram.quantile(1.0), Some(4.0));
        assert_eq!(histogram.quantile(0.0), Some(0.0));
        assert_eq!(histogram.quantile(1.5), None);

        histogram.observe(100.0);
        assert_eq!(histogram.quantile(1.0), Some(4.0));
        assert_eq!(HistogramValue::new(Arc::from(&[1.0][..])).quantile(0.5), None);
    }

    #[test]
    fn test_boundary_value_counts_in_its_bucket() {
        let mut histogram = HistogramValue::new(Arc::from(&[1.0, 2.0][..]));
        histogram.observe(1.0);
        assert_eq!(histogram.cumulative, vec![1, 1, 1]);
    }

    #[test]
    fn test_snapshot_in_creation_order() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let b = series(&index, "__name__:b");
        let a = series(&index, "__name__:a");
        agg.set(a, 1, 1.0).unwrap();
        agg.increment(b, 1, 2.0).unwrap();
        let snapshot = agg.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].series, b);
        assert_eq!(snapshot[1].series, a);
    }

    #[test]
    fn test_truncate_preserves_current_values() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let c = series(&index, "__name__:c");
        let h = series(&index, "__name__:h");
        agg.increment(c, 1, 5.0).unwrap();
        agg.increment(c, 20, 1.0).unwrap();
        agg.observe(h, 1, 0.1).unwrap();
        agg.observe(h, 20, 0.2).unwrap();

        assert_eq!(agg.truncate_before(10), 2);
        assert_eq!(counter_value(&agg, c), 6.0);
        let SeriesWindow::Counter(samples) =
            agg.window(c, TimeRange::new(0, 100).unwrap()).unwrap()
        else {
            panic!("expected counter window");
        };
        assert_eq!(samples, vec![Sample { timestamp: 20, value: 6.0 }]);

        match agg.current(h).unwrap() {
            MetricValue::Histogram(v) => assert_eq!(v.count, 2),
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn test_counter_sample_before_compaction_rejected() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let c = series(&index, "__name__:c");
        agg.increment(c, 1, 5.0).unwrap();
        agg.increment(c, 8, 2.0).unwrap();
        agg.increment(c, 20, 1.0).unwrap();
        assert_eq!(agg.truncate_before(10), 2);

        assert_eq!(
            agg.reset_counter(c, 4),
            Err(AggregateError::SampleBeforeCompaction {
                series: c,
                timestamp: 4,
                compacted_before: 10,
            })
        );
        assert!(agg.increment(c, 9, 1.0).is_err());
        assert_eq!(counter_value(&agg, c), 8.0);

        agg.increment(c, 10, 1.0).unwrap();
        assert_eq!(counter_value(&agg, c), 9.0);
    }

    #[test]
    fn test_non_finite_rejected() {
        let index = LabelIndex::new(10);
        let agg = aggregator();
        let id = series(&index, "__name__:g");
        assert_eq!(
            agg.set(id, 1, f64::NAN),
            Err(AggregateError::NonFiniteValue(id))
        );
        assert!(agg.is_empty());
    }
}
