// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded range queries over the metric aggregator and the log store.
//!
//! A query is validated in full before any storage is read. Without a step, non-raw ops are
//! evaluated once at `end` over the whole range. With a step they are evaluated at
//! `start, start + step, ...` up to `end`, each instant looking back over `[t - step, t]`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregator::{counter_increase, HistogramValue, MetricAggregator, Sample, SeriesWindow};
use crate::constants::{MAX_QUERY_POINTS, METRIC_NAME_LABEL};
use crate::errors::QueryError;
use crate::event::{LogLine, TimeRange, Timestamp};
use crate::index::{LabelIndex, SeriesId};
use crate::labels::{LabelSet, EMPTY_LABELS};
use crate::log_store::LogStore;
use crate::matcher::Matcher;

/// Lines scanned between two deadline checks on log queries.
const LOG_DEADLINE_STRIDE: usize = 1_024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    Raw,
    Rate,
    Sum,
    Avg,
    Count,
    Quantile(f64),
}

impl FromStr for Op {
    type Err = QueryError;

    /// Accepts `raw`, `rate`, `sum`, `avg`, `count` and `quantile(p)` with `0 <= p <= 1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let op = match trimmed {
            "raw" => Op::Raw,
            "rate" => Op::Rate,
            "sum" => Op::Sum,
            "avg" => Op::Avg,
            "count" => Op::Count,
            _ => {
                let p = trimmed
                    .strip_prefix("quantile(")
                    .and_then(|r| r.strip_suffix(')'))
                    .and_then(|p| p.trim().parse::<f64>().ok())
                    .ok_or_else(|| QueryError::UnsupportedOp(trimmed.to_string()))?;
                if !(0.0..=1.0).contains(&p) {
                    return Err(QueryError::UnsupportedOp(trimmed.to_string()));
                }
                Op::Quantile(p)
            }
        };
        Ok(op)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Raw => f.write_str("raw"),
            Op::Rate => f.write_str("rate"),
            Op::Sum => f.write_str("sum"),
            Op::Avg => f.write_str("avg"),
            Op::Count => f.write_str("count"),
            Op::Quantile(p) => write!(f, "quantile({p})"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Metrics,
    Logs,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub matchers: Vec<Matcher>,
    pub start: Timestamp,
    pub end: Timestamp,
    pub op: Op,
    pub target: Target,
    /// Evaluation step in milliseconds.
    pub step: Option<i64>,
    /// Cap on returned log lines for raw log queries.
    pub limit: Option<usize>,
    pub deadline: Option<Instant>,
}

impl Query {
    pub fn metrics(matchers: Vec<Matcher>, start: Timestamp, end: Timestamp, op: Op) -> Self {
        Self {
            matchers,
            start,
            end,
            op,
            target: Target::Metrics,
            step: None,
            limit: None,
            deadline: None,
        }
    }

    pub fn logs(matchers: Vec<Matcher>, start: Timestamp, end: Timestamp) -> Self {
        Self {
            target: Target::Logs,
            ..Self::metrics(matchers, start, end, Op::Raw)
        }
    }

    #[must_use]
    pub fn with_op(mut self, op: Op) -> Self {
        self.op = op;
        self
    }

    #[must_use]
    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn range(&self) -> Result<TimeRange, QueryError> {
        TimeRange::new(self.start, self.end)
    }

    fn validate(&self) -> Result<(), QueryError> {
        self.range()?;
        if let Op::Quantile(p) = self.op {
            if !(0.0..=1.0).contains(&p) {
                return Err(QueryError::UnsupportedOp(self.op.to_string()));
            }
        }
        if self.target == Target::Logs && !matches!(self.op, Op::Raw | Op::Count) {
            return Err(QueryError::UnsupportedOp(format!("{} on logs", self.op)));
        }
        if let Some(step) = self.step {
            let invalid = QueryError::InvalidStep {
                step,
                max_points: MAX_QUERY_POINTS,
            };
            if step <= 0 {
                return Err(invalid);
            }
            let points = (i128::from(self.end) - i128::from(self.start)) / i128::from(step) + 1;
            if usize::try_from(points).map_or(true, |p| p > MAX_QUERY_POINTS) {
                return Err(invalid);
            }
        }
        Ok(())
    }

    /// Evaluation instants with their lookback windows.
    fn instants(&self) -> Vec<(Timestamp, TimeRange)> {
        match self.step {
            None | Some(0) => vec![(
                self.end,
                TimeRange {
                    start: self.start,
                    end: self.end,
                },
            )],
            Some(step) => {
                let mut instants = Vec::new();
                let mut t = self.start;
                while t <= self.end {
                    instants.push((
                        t,
                        TimeRange {
                            start: t.saturating_sub(step),
                            end: t,
                        },
                    ));
                    t = t.saturating_add(step);
                    if t == Timestamp::MAX {
                        break;
                    }
                }
                instants
            }
        }
    }

    /// Smallest range covering every lookback window.
    fn outer_range(&self, instants: &[(Timestamp, TimeRange)]) -> TimeRange {
        let start = instants
            .iter()
            .map(|(_, w)| w.start)
            .min()
            .unwrap_or(self.start)
            .min(self.start);
        TimeRange {
            start,
            end: self.end,
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Point {
    pub timestamp: Timestamp,
    pub value: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SeriesResult {
    pub labels: LabelSet,
    pub points: Vec<Point>,
}

/// An empty result is a valid answer: no series matched.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Series(Vec<SeriesResult>),
    Logs(Vec<LogLine>),
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        match self {
            QueryResult::Series(series) => series.is_empty(),
            QueryResult::Logs(lines) => lines.is_empty(),
        }
    }
}

fn slice_window(samples: &[Sample], window: TimeRange) -> &[Sample] {
    let lo = samples.partition_point(|s| s.timestamp < window.start);
    let hi = samples.partition_point(|s| s.timestamp <= window.end);
    &samples[lo..hi.max(lo)]
}

/// Per-second increase over the window, from its first to its last sample.
fn rate(samples: &[Sample]) -> Option<f64> {
    let (first, last) = (samples.first()?, samples.last()?);
    let elapsed = last.timestamp.checked_sub(first.timestamp)? as f64 / 1_000.0;
    if samples.len() < 2 || elapsed <= 0.0 {
        return None;
    }
    Some(counter_increase(samples) / elapsed)
}

/// Running cross-series reduction for one evaluation instant.
#[derive(Clone, Copy, Default)]
struct Accumulator {
    sum: f64,
    count: usize,
}

#[derive(Clone)]
pub struct QueryEngine {
    index: Arc<LabelIndex>,
    aggregator: Arc<MetricAggregator>,
    logs: Arc<LogStore>,
}

impl QueryEngine {
    pub fn new(
        index: Arc<LabelIndex>,
        aggregator: Arc<MetricAggregator>,
        logs: Arc<LogStore>,
    ) -> Self {
        Self {
            index,
            aggregator,
            logs,
        }
    }

    pub fn execute(&self, query: &Query) -> Result<QueryResult, QueryError> {
        query.validate()?;
        debug!(
            op = %query.op,
            target = ?query.target,
            start = query.start,
            end = query.end,
            matchers = query.matchers.len(),
            "Executing query"
        );
        match query.target {
            Target::Metrics => self.execute_metrics(query),
            Target::Logs => self.execute_logs(query),
        }
    }

    /// Distinct metric names, sorted.
    pub fn metric_names(&self) -> Vec<String> {
        self.index.label_values(METRIC_NAME_LABEL)
    }

    pub fn label_values(&self, key: &str) -> Vec<String> {
        self.index.label_values(key)
    }

    fn execute_metrics(&self, query: &Query) -> Result<QueryResult, QueryError> {
        let series = self.index.scan(&query.matchers);
        let instants = query.instants();
        let outer = query.outer_range(&instants);

        let mut results = Vec::new();
        let mut accumulators = vec![Accumulator::default(); instants.len()];
        for id in series {
            if query.expired() {
                let partial = match query.op {
                    Op::Sum | Op::Avg | Op::Count => {
                        reduce(query.op, &instants, &accumulators).into_iter().collect()
                    }
                    _ => results,
                };
                return Err(QueryError::DeadlineExceeded {
                    partial: Box::new(QueryResult::Series(partial)),
                });
            }
            let Some(window) = self.aggregator.window(id, outer) else {
                continue;
            };
            match query.op {
                Op::Raw => {
                    let range = TimeRange {
                        start: query.start,
                        end: query.end,
                    };
                    let points = raw_points(&window, range);
                    self.push_series(&mut results, id, points);
                }
                Op::Rate => {
                    let SeriesWindow::Counter(samples) = &window else {
                        continue;
                    };
                    let points = instants
                        .iter()
                        .filter_map(|(t, w)| {
                            rate(slice_window(samples, *w)).map(|value| Point {
                                timestamp: *t,
                                value,
                            })
                        })
                        .collect();
                    self.push_series(&mut results, id, points);
                }
                Op::Quantile(p) => {
                    let SeriesWindow::Histogram {
                        bounds,
                        observations,
                    } = &window
                    else {
                        continue;
                    };
                    let points = instants
                        .iter()
                        .filter_map(|(t, w)| {
                            let observed = slice_window(observations, *w);
                            HistogramValue::from_observations(Arc::clone(bounds), observed)
                                .quantile(p)
                                .map(|value| Point {
                                    timestamp: *t,
                                    value,
                                })
                        })
                        .collect();
                    self.push_series(&mut results, id, points);
                }
                Op::Sum | Op::Avg | Op::Count => {
                    let samples = match &window {
                        SeriesWindow::Counter(samples) | SeriesWindow::Gauge(samples) => samples,
                        SeriesWindow::Histogram { observations, .. } => {
                            if query.op != Op::Count {
                                continue;
                            }
                            observations
                        }
                    };
                    for ((_, w), acc) in instants.iter().zip(accumulators.iter_mut()) {
                        if let Some(last) = slice_window(samples, *w).last() {
                            acc.sum += last.value;
                            acc.count += 1;
                        }
                    }
                }
            }
        }

        if matches!(query.op, Op::Sum | Op::Avg | Op::Count) {
            results = reduce(query.op, &instants, &accumulators).into_iter().collect();
        }
        Ok(QueryResult::Series(results))
    }

    fn push_series(&self, results: &mut Vec<SeriesResult>, id: SeriesId, points: Vec<Point>) {
        if points.is_empty() {
            return;
        }
        if let Some(labels) = self.index.labels(id) {
            results.push(SeriesResult { labels, points });
        }
    }

    fn execute_logs(&self, query: &Query) -> Result<QueryResult, QueryError> {
        let instants = query.instants();
        let range = match query.op {
            Op::Count => query.outer_range(&instants),
            _ => query.range()?,
        };
        let cursor = self.logs.query(&self.index, &query.matchers, range);
        let limit = match query.op {
            Op::Raw => query.limit.unwrap_or(usize::MAX),
            _ => usize::MAX,
        };

        let mut lines = Vec::new();
        for (scanned, line) in cursor.take(limit).enumerate() {
            if scanned % LOG_DEADLINE_STRIDE == 0 && query.expired() {
                let partial = match query.op {
                    Op::Count => QueryResult::Series(count_lines(&instants, &lines)),
                    _ => QueryResult::Logs(lines),
                };
                return Err(QueryError::DeadlineExceeded {
                    partial: Box::new(partial),
                });
            }
            lines.push(line);
        }

        match query.op {
            Op::Count => Ok(QueryResult::Series(count_lines(&instants, &lines))),
            _ => Ok(QueryResult::Logs(lines)),
        }
    }
}

fn raw_points(window: &SeriesWindow, range: TimeRange) -> Vec<Point> {
    let samples = match window {
        SeriesWindow::Counter(samples) | SeriesWindow::Gauge(samples) => samples,
        SeriesWindow::Histogram { observations, .. } => observations,
    };
    slice_window(samples, range)
        .iter()
        .map(|s| Point {
            timestamp: s.timestamp,
            value: s.value,
        })
        .collect()
}

/// Collapses per-instant accumulators into a single label-less series.
fn reduce(
    op: Op,
    instants: &[(Timestamp, TimeRange)],
    accumulators: &[Accumulator],
) -> Option<SeriesResult> {
    let points: Vec<Point> = instants
        .iter()
        .zip(accumulators)
        .filter(|(_, acc)| acc.count > 0)
        .map(|((t, _), acc)| Point {
            timestamp: *t,
            value: match op {
                Op::Avg => acc.sum / acc.count as f64,
                Op::Count => acc.count as f64,
                _ => acc.sum,
            },
        })
        .collect();
    if points.is_empty() {
        return None;
    }
    Some(SeriesResult {
        labels: EMPTY_LABELS,
        points,
    })
}

fn count_lines(instants: &[(Timestamp, TimeRange)], lines: &[LogLine]) -> Vec<SeriesResult> {
    let points: Vec<Point> = instants
        .iter()
        .map(|(t, w)| {
            let lo = lines.partition_point(|l| l.timestamp < w.start);
            let hi = lines.partition_point(|l| l.timestamp <= w.end);
            Point {
                timestamp: *t,
                value: hi.saturating_sub(lo) as f64,
            }
        })
        .filter(|p| p.value > 0.0)
        .collect();
    if points.is_empty() {
        return Vec::new();
    }
    vec![SeriesResult {
        labels: EMPTY_LABELS,
        points,
    }]
}
