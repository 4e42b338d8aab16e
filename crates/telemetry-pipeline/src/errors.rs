// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the pipeline.
//!
//! Ingestion-path errors (`IngestError`, `AggregateError`, `IndexError`) stop at the ingest
//! boundary: they are counted in [`crate::stats::PipelineStats`] and logged, never raised at
//! producers as fatal. Query-path errors are returned synchronously to the caller.

use crate::event::EventKind;
use crate::index::SeriesId;
use crate::query::QueryResult;

/// Failure to parse labels, selectors, statsd lines or structured fields.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("parse failure: {0}")]
    Raw(String),
    #[error("unsupported metric type: {0}")]
    UnsupportedType(String),
    #[error("duplicate label key with conflicting values: {0}")]
    DuplicateLabel(String),
    #[error("too many labels, more than {0}")]
    TooManyLabels(usize),
    #[error("label name must not be empty")]
    EmptyLabelName,
    #[error("invalid metric name: {0}")]
    InvalidMetricName(String),
    #[error("too many fields, more than {0}")]
    TooManyFields(usize),
    #[error("field {0} exceeds the maximum value size")]
    FieldTooLarge(String),
}

/// Rejection of an event at the ingest boundary.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum IngestError {
    /// Transient: the buffer is at capacity. Drop or retry.
    #[error("ingest buffer is full")]
    BufferFull,
    #[error("ingest buffer is closed")]
    Closed,
    #[error("negative delta {0} on counter")]
    NegativeDeltaOnCounter(f64),
    #[error("invalid event: {0}")]
    Invalid(String),
}

impl From<ParseError> for IngestError {
    fn from(e: ParseError) -> Self {
        IngestError::Invalid(e.to_string())
    }
}

/// Errors raised by the metric aggregator. The offending sample is dropped, state is untouched.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum AggregateError {
    #[error("negative delta {delta} on counter series {series}")]
    NegativeDeltaOnCounter { series: SeriesId, delta: f64 },
    #[error("series {series} is a {existing}, cannot record a {attempted}")]
    KindConflict {
        series: SeriesId,
        existing: EventKind,
        attempted: EventKind,
    },
    #[error("non-finite value on series {0}")]
    NonFiniteValue(SeriesId),
    #[error("counter sample at {timestamp} on series {series} is older than the compacted history ending at {compacted_before}")]
    SampleBeforeCompaction {
        series: SeriesId,
        timestamp: i64,
        compacted_before: i64,
    },
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    #[error("series limit of {0} reached")]
    SeriesLimitReached(usize),
}

/// Query rejected before or during execution.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: i64, end: i64 },
    #[error("unsupported operation: {0}")]
    UnsupportedOp(String),
    #[error("invalid matcher: {0}")]
    InvalidMatcher(String),
    #[error("invalid step {step}: must be positive and yield at most {max_points} points")]
    InvalidStep { step: i64, max_points: usize },
    #[error("query deadline exceeded")]
    DeadlineExceeded { partial: Box<QueryResult> },
}

impl From<ParseError> for QueryError {
    fn from(e: ParseError) -> Self {
        QueryError::InvalidMatcher(e.to_string())
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ScrapeError {
    #[error("scrape deadline exceeded")]
    DeadlineExceeded { partial: String },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ShipError {
    #[error("batch id must not be empty")]
    MissingBatchId,
}

/// Invalid pipeline configuration.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum Creation {
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = QueryError::InvalidTimeRange { start: 10, end: 5 };
        assert_eq!(
            error.to_string(),
            "invalid time range: start 10 is after end 5"
        );
        assert_eq!(IngestError::BufferFull.to_string(), "ingest buffer is full");
    }

    #[test]
    fn test_parse_error_converts_to_ingest_error() {
        let error: IngestError = ParseError::EmptyLabelName.into();
        assert_eq!(
            error,
            IngestError::Invalid("label name must not be empty".to_string())
        );
    }
}
