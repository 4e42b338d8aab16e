// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An explicitly constructed pipeline instance.
//!
//! [`Pipeline::new`] returns the pipeline together with its [`IngestService`]; the caller spawns
//! `service.run()` on its runtime. The pipeline itself is cheap to clone and is what producers,
//! the query side and the gateway are obtained from.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::aggregator::MetricAggregator;
use crate::constants::{
    DEFAULT_BUFFER_CAPACITY, DEFAULT_HISTOGRAM_BUCKETS, DEFAULT_MAX_SERIES,
    DEFAULT_RECENT_BATCH_WINDOW, DEFAULT_RETENTION_SECS,
};
use crate::errors::{Creation, IngestError, QueryError, ScrapeError};
use crate::event::Timestamp;
use crate::gateway::Gateway;
use crate::index::LabelIndex;
use crate::ingest::{IngestHandle, IngestService, Storage};
use crate::labels::LabelSet;
use crate::log_store::LogStore;
use crate::producer::Producer;
use crate::query::{Query, QueryEngine, QueryResult};
use crate::stats::PipelineStats;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineConfig {
    /// Events the ingest buffer holds before rejecting submissions.
    pub buffer_capacity: usize,
    /// Upper bounds of the histogram buckets, finite and strictly increasing.
    pub histogram_buckets: Vec<f64>,
    pub max_series: usize,
    /// Batch ids remembered by the gateway for deduplication.
    pub recent_batch_window: usize,
    /// Log lines and metric samples older than this are compacted away.
    pub retention: Duration,
    /// Labels attached to every ingested event. Event labels win on conflicts.
    pub base_labels: LabelSet,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            histogram_buckets: DEFAULT_HISTOGRAM_BUCKETS.to_vec(),
            max_series: DEFAULT_MAX_SERIES,
            recent_batch_window: DEFAULT_RECENT_BATCH_WINDOW,
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            base_labels: LabelSet::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), Creation> {
        let invalid = |msg: &str| Err(Creation::InvalidConfig(msg.to_string()));
        if self.buffer_capacity == 0 {
            return invalid("buffer_capacity must be greater than zero");
        }
        if self.max_series == 0 {
            return invalid("max_series must be greater than zero");
        }
        if self.recent_batch_window == 0 {
            return invalid("recent_batch_window must be greater than zero");
        }
        if self.histogram_buckets.is_empty() {
            return invalid("histogram_buckets must not be empty");
        }
        if self.histogram_buckets.iter().any(|b| !b.is_finite()) {
            return invalid("histogram_buckets must be finite");
        }
        if self.histogram_buckets.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("histogram_buckets must be strictly increasing");
        }
        if self.retention.is_zero() {
            return invalid("retention must be greater than zero");
        }
        Ok(())
    }
}

/// Samples and lines removed by one compaction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Compaction {
    pub log_lines: usize,
    pub metric_samples: usize,
}

#[derive(Clone)]
pub struct Pipeline {
    handle: IngestHandle,
    storage: Storage,
    engine: QueryEngine,
    gateway: Arc<Gateway>,
    retention: Duration,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<(Self, IngestService), Creation> {
        config.validate()?;

        let storage = Storage {
            index: Arc::new(LabelIndex::new(config.max_series)),
            aggregator: Arc::new(MetricAggregator::new(&config.histogram_buckets)),
            logs: Arc::new(LogStore::new()),
            stats: Arc::new(PipelineStats::new()),
        };
        let (service, handle) =
            IngestService::new(config.buffer_capacity, storage.clone(), config.base_labels);
        let engine = QueryEngine::new(
            Arc::clone(&storage.index),
            Arc::clone(&storage.aggregator),
            Arc::clone(&storage.logs),
        );
        let gateway = Arc::new(Gateway::new(
            handle.clone(),
            storage.clone(),
            config.recent_batch_window,
        ));

        let pipeline = Self {
            handle,
            storage,
            engine,
            gateway,
            retention: config.retention,
        };
        Ok((pipeline, service))
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.handle.clone())
    }

    pub fn handle(&self) -> &IngestHandle {
        &self.handle
    }

    pub fn query_engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.storage.stats
    }

    pub fn query(&self, query: &Query) -> Result<QueryResult, QueryError> {
        self.engine.execute(query)
    }

    pub fn scrape(&self) -> Result<String, ScrapeError> {
        self.gateway.scrape(None)
    }

    /// Drops log lines and metric history older than `now - retention`.
    pub fn compact(&self, now: Timestamp) -> Compaction {
        let retention = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(retention);
        let compaction = Compaction {
            log_lines: self.storage.logs.truncate_before(cutoff),
            metric_samples: self.storage.aggregator.truncate_before(cutoff),
        };
        debug!(
            cutoff,
            log_lines = compaction.log_lines,
            metric_samples = compaction.metric_samples,
            "Compacted pipeline storage"
        );
        compaction
    }

    /// Waits until every event submitted so far has been applied.
    pub async fn sync(&self) -> Result<(), IngestError> {
        self.handle.sync().await
    }

    pub async fn shutdown(&self) -> Result<(), IngestError> {
        self.handle.shutdown().await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{Event, Fields, Payload};
    use crate::labels::EMPTY_LABELS;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(PipelineConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_invalid_configs() {
        let cases = [
            PipelineConfig {
                buffer_capacity: 0,
                ..Default::default()
            },
            PipelineConfig {
                histogram_buckets: vec![],
                ..Default::default()
            },
            PipelineConfig {
                histogram_buckets: vec![1.0, 1.0],
                ..Default::default()
            },
            PipelineConfig {
                histogram_buckets: vec![1.0, f64::INFINITY],
                ..Default::default()
            },
            PipelineConfig {
                retention: Duration::ZERO,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(Pipeline::new(config).is_err());
        }
    }

    #[tokio::test]
    async fn test_compact_respects_retention() {
        let config = PipelineConfig {
            retention: Duration::from_secs(10),
            ..Default::default()
        };
        let (pipeline, service) = Pipeline::new(config).unwrap();
        let service_task = tokio::spawn(service.run());

        let producer = pipeline.producer();
        for ts in [1_000, 15_000] {
            producer
                .submit(Event::log(
                    ts,
                    LabelSet::parse("level:INFO").unwrap(),
                    "hello".to_string(),
                    Fields::new(),
                ))
                .unwrap();
            producer
                .record_at("hits", &EMPTY_LABELS, ts, Payload::Counter(1.0))
                .unwrap();
        }
        pipeline.sync().await.unwrap();

        let compaction = pipeline.compact(20_000);
        assert_eq!(
            compaction,
            Compaction {
                log_lines: 1,
                metric_samples: 1,
            }
        );
        // the counter keeps its total after compaction
        assert!(pipeline
            .scrape()
            .unwrap()
            .starts_with("hits 2\n"));

        pipeline.shutdown().await.unwrap();
        service_task.await.unwrap();
    }
}
