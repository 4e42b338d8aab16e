// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self metrics of the pipeline, appended to every scrape.

use std::sync::atomic::{AtomicU64, Ordering};

use derive_more::Display;

pub const ACCEPTED_METRIC: &str = "pipeline_events_accepted_total";
pub const DROPPED_METRIC: &str = "pipeline_dropped_events_total";

/// Value of the `reason` label on the dropped events counter.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum DropReason {
    #[display("buffer_full")]
    BufferFull,
    #[display("negative_delta")]
    NegativeDelta,
    #[display("kind_conflict")]
    KindConflict,
    #[display("series_limit")]
    SeriesLimit,
    #[display("invalid")]
    Invalid,
    /// Counter sample older than the last compaction cutoff.
    #[display("late_sample")]
    LateSample,
}

impl DropReason {
    pub const ALL: [DropReason; 6] = [
        DropReason::BufferFull,
        DropReason::NegativeDelta,
        DropReason::KindConflict,
        DropReason::SeriesLimit,
        DropReason::Invalid,
        DropReason::LateSample,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    accepted: AtomicU64,
    dropped: [AtomicU64; DropReason::ALL.len()],
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, reason: DropReason) {
        self.dropped[reason.slot()].fetch_add(1, Ordering::Relaxed);
    }

    /// Events applied to storage by the drain loop.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[reason.slot()].load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        DropReason::ALL.iter().map(|r| self.dropped(*r)).sum()
    }

    /// Exposition lines for the self metrics. Every reason is listed, zero or not.
    pub fn render(&self, out: &mut String) {
        use std::fmt::Write as _;
        // writing to a String cannot fail
        let _ = writeln!(out, "{ACCEPTED_METRIC} {}", self.accepted());
        for reason in DropReason::ALL {
            let _ = writeln!(
                out,
                "{DROPPED_METRIC}{{reason=\"{reason}\"}} {}",
                self.dropped(reason)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_reason() {
        let stats = PipelineStats::new();
        stats.record_accepted();
        stats.record_dropped(DropReason::BufferFull);
        stats.record_dropped(DropReason::BufferFull);
        stats.record_dropped(DropReason::KindConflict);
        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.dropped(DropReason::BufferFull), 2);
        assert_eq!(stats.dropped(DropReason::SeriesLimit), 0);
        assert_eq!(stats.dropped_total(), 3);
    }

    #[test]
    fn test_render() {
        let stats = PipelineStats::new();
        stats.record_dropped(DropReason::NegativeDelta);
        let mut out = String::new();
        stats.render(&mut out);
        assert!(out.starts_with("pipeline_events_accepted_total 0\n"));
        assert!(out.contains("pipeline_dropped_events_total{reason=\"negative_delta\"} 1\n"));
        assert_eq!(out.lines().count(), 1 + DropReason::ALL.len());
    }

    #[test]
    fn test_reason_labels() {
        let labels: Vec<String> = DropReason::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            labels,
            vec![
                "buffer_full",
                "negative_delta",
                "kind_conflict",
                "series_limit",
                "invalid",
                "late_sample"
            ]
        );
    }
}
