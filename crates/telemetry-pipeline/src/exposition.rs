// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Text exposition of a metric snapshot.
//!
//! One `name{label="value",...} number` line per series, in series creation order. A histogram
//! expands into cumulative `name_bucket{...,le="bound"}` lines (the last one `le="+Inf"`)
//! followed by `name_sum` and `name_count`. Label values are escaped (`\\`, `\"`, `\n`).

use std::fmt::Write as _;
use std::time::Instant;

use crate::aggregator::{MetricValue, SnapshotEntry};
use crate::errors::ScrapeError;
use crate::index::LabelIndex;
use crate::labels::{write_label_block, LabelSet};
use crate::stats::PipelineStats;

/// Formats a sample value the way the exposition format spells them.
pub fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn write_sample(
    out: &mut String,
    name: &str,
    labels: &LabelSet,
    extra: &[(&str, &str)],
    value: &str,
) {
    // writing to a String cannot fail
    let _ = out.write_str(name);
    let _ = write_label_block(out, labels, extra);
    let _ = writeln!(out, " {value}");
}

fn write_entry(out: &mut String, name: &str, labels: &LabelSet, value: &MetricValue) {
    match value {
        MetricValue::Counter(v) | MetricValue::Gauge(v) => {
            write_sample(out, name, labels, &[], &format_value(*v));
        }
        MetricValue::Histogram(histogram) => {
            let bucket = format!("{name}_bucket");
            let bounds = histogram
                .bounds
                .iter()
                .map(|b| format_value(*b))
                .chain(std::iter::once("+Inf".to_string()));
            for (le, count) in bounds.zip(&histogram.cumulative) {
                write_sample(out, &bucket, labels, &[("le", le.as_str())], &count.to_string());
            }
            write_sample(
                out,
                &format!("{name}_sum"),
                labels,
                &[],
                &format_value(histogram.sum),
            );
            write_sample(
                out,
                &format!("{name}_count"),
                labels,
                &[],
                &histogram.count.to_string(),
            );
        }
    }
}

/// Renders `snapshot` followed by the pipeline self metrics.
///
/// On deadline expiry the lines rendered so far are returned inside the error.
pub fn render(
    index: &LabelIndex,
    snapshot: &[SnapshotEntry],
    stats: &PipelineStats,
    deadline: Option<Instant>,
) -> Result<String, ScrapeError> {
    let mut out = String::new();
    for entry in snapshot {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ScrapeError::DeadlineExceeded { partial: out });
        }
        let Some(labels) = index.labels(entry.series) else {
            continue;
        };
        let Some(name) = labels.name() else {
            continue;
        };
        write_entry(&mut out, name, &labels, &entry.value);
    }
    stats.render(&mut out);
    Ok(out)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator::MetricAggregator;
    use std::time::Duration;

    fn resolve(index: &LabelIndex, name: &str, tags: &str) -> crate::index::SeriesId {
        let labels = LabelSet::metric(name, &LabelSet::parse(tags).unwrap()).unwrap();
        index.resolve(&labels).unwrap()
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(3.0), "3");
        assert_eq!(format_value(0.25), "0.25");
        assert_eq!(format_value(f64::INFINITY), "+Inf");
        assert_eq!(format_value(f64::NAN), "NaN");
    }

    #[test]
    fn test_render_counters_gauges_histograms() {
        let index = LabelIndex::new(100);
        let aggregator = MetricAggregator::new(&[0.1, 1.0]);
        let requests = resolve(&index, "http_requests_total", "endpoint:/products");
        let inflight = resolve(&index, "inflight", "");
        let latency = resolve(&index, "latency_seconds", "endpoint:/products");
        for ts in 0..3 {
            aggregator.increment(requests, ts, 1.0).unwrap();
        }
        aggregator.set(inflight, 0, 2.5).unwrap();
        aggregator.observe(latency, 0, 0.0625).unwrap();
        aggregator.observe(latency, 1, 0.5).unwrap();

        let stats = PipelineStats::new();
        let text = render(&index, &aggregator.snapshot(), &stats, None).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            &lines[..7],
            &[
                "http_requests_total{endpoint=\"/products\"} 3",
                "inflight 2.5",
                "latency_seconds_bucket{endpoint=\"/products\",le=\"0.1\"} 1",
                "latency_seconds_bucket{endpoint=\"/products\",le=\"1\"} 2",
                "latency_seconds_bucket{endpoint=\"/products\",le=\"+Inf\"} 2",
                "latency_seconds_sum{endpoint=\"/products\"} 0.5625",
                "latency_seconds_count{endpoint=\"/products\"} 2",
            ]
        );
        assert_eq!(lines[7], "pipeline_events_accepted_total 0");
    }

    #[test]
    fn test_render_escapes_label_values() {
        let index = LabelIndex::new(100);
        let aggregator = MetricAggregator::new(&[1.0]);
        let id = index
            .resolve(
                &LabelSet::metric(
                    "errors_total",
                    &LabelSet::from_pairs([("msg", "say \"hi\"")]).unwrap(),
                )
                .unwrap(),
            )
            .unwrap();
        aggregator.increment(id, 0, 1.0).unwrap();
        let text = render(&index, &aggregator.snapshot(), &PipelineStats::new(), None).unwrap();
        assert!(text.starts_with("errors_total{msg=\"say \\\"hi\\\"\"} 1\n"));
    }

    #[test]
    fn test_render_deadline() {
        let index = LabelIndex::new(100);
        let aggregator = MetricAggregator::new(&[1.0]);
        let id = resolve(&index, "up", "");
        aggregator.set(id, 0, 1.0).unwrap();
        let expired = Instant::now()
            .checked_sub(Duration::from_millis(1))
            .unwrap_or_else(Instant::now);
        assert_eq!(
            render(&index, &aggregator.snapshot(), &PipelineStats::new(), Some(expired)),
            Err(ScrapeError::DeadlineExceeded {
                partial: String::new()
            })
        );
    }
}
