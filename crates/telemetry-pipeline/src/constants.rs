// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Label holding the metric name of a series.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Maximum number of labels on a single series, base labels included.
pub const MAX_LABELS: usize = 64;

/// Maximum number of structured fields attached to one log line.
pub const MAX_FIELDS: usize = 32;

/// Maximum size in bytes of a single string field value.
pub const MAX_FIELD_VALUE_BYTES: usize = 4 * 1_024;

/// Maximum size in bytes of a log message. Longer messages are rejected.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1_024;

/// Default capacity of the ingest buffer, in events.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Default cap on distinct series tracked by the label index.
pub const DEFAULT_MAX_SERIES: usize = 100_000;

/// Number of recent batch ids remembered by the gateway for deduplication.
pub const DEFAULT_RECENT_BATCH_WINDOW: usize = 1_024;

/// Default retention horizon for log lines and metric samples.
pub const DEFAULT_RETENTION_SECS: u64 = 6 * 60 * 60;

/// Upper bounds of the default histogram buckets, in the unit observed (seconds for latency).
/// An implicit `+Inf` bucket is always appended.
pub const DEFAULT_HISTOGRAM_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Maximum number of evaluation instants a stepped query may produce.
pub const MAX_QUERY_POINTS: usize = 11_000;

/// Content type of the scrape exposition format.
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
