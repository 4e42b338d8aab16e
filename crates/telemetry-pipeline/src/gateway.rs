// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull and push sides of the pipeline.
//!
//! `scrape` renders the current metric snapshot. `ship` ingests a batch of log entries and is
//! idempotent per batch id: the gateway remembers, for the most recent batches, which entries
//! are settled (accepted or permanently rejected). A resubmission only retries the entries that
//! were turned away as transient (`BufferFull`), so nothing is stored twice. The memory is
//! bounded; a batch id older than the window is treated as new.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zstd::zstd_safe::CompressionLevel;

use crate::errors::{IngestError, ParseError, ScrapeError, ShipError};
use crate::event::{now_millis, Event, Fields, Timestamp};
use crate::exposition;
use crate::ingest::{IngestHandle, Storage};
use crate::labels::LabelSet;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the epoch; the arrival time when missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Fields::is_empty")]
    pub fields: Fields,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub batch_id: String,
    pub entries: Vec<LogEntry>,
}

impl LogBatch {
    /// Decodes a JSON batch, zstd-compressed when `compressed` is set.
    pub fn decode(body: &[u8], compressed: bool) -> Result<Self, ParseError> {
        let batch = if compressed {
            let raw = zstd::decode_all(body)
                .map_err(|e| ParseError::Raw(format!("invalid zstd body: {e}")))?;
            serde_json::from_slice(&raw)
        } else {
            serde_json::from_slice(body)
        };
        batch.map_err(|e| ParseError::Raw(format!("invalid log batch: {e}")))
    }

    /// JSON encoding compressed with zstd at `level`.
    pub fn encode(&self, level: CompressionLevel) -> Result<Vec<u8>, ParseError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| ParseError::Raw(format!("failed to serialize log batch: {e}")))?;
        zstd::encode_all(json.as_slice(), level)
            .map_err(|e| ParseError::Raw(format!("failed to compress log batch: {e}")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub index: usize,
    pub reason: String,
    /// True when resubmitting the batch may succeed for this entry.
    pub retryable: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShipResponse {
    pub accepted: usize,
    pub rejected: usize,
    /// Entries skipped because an earlier submission of the batch already settled them.
    pub duplicate: usize,
    pub rejections: Vec<Rejection>,
}

impl ShipResponse {
    pub fn has_retryable(&self) -> bool {
        self.rejections.iter().any(|r| r.retryable)
    }
}

struct RecentBatches {
    order: VecDeque<String>,
    settled: HashMap<String, Vec<bool>, FnvBuildHasher>,
    capacity: usize,
}

impl RecentBatches {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            settled: HashMap::default(),
            capacity,
        }
    }

    fn remember(&mut self, batch_id: &str, mask: Vec<bool>) {
        if self.settled.insert(batch_id.to_string(), mask).is_none() {
            self.order.push_back(batch_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }
}

pub struct Gateway {
    handle: IngestHandle,
    storage: Storage,
    recent: Mutex<RecentBatches>,
}

impl Gateway {
    pub fn new(handle: IngestHandle, storage: Storage, recent_batch_window: usize) -> Self {
        Self {
            handle,
            storage,
            recent: Mutex::new(RecentBatches::new(recent_batch_window)),
        }
    }

    /// Current metric snapshot in the text exposition format.
    pub fn scrape(&self, deadline: Option<Instant>) -> Result<String, ScrapeError> {
        let snapshot = self.storage.aggregator.snapshot();
        exposition::render(
            &self.storage.index,
            &snapshot,
            &self.storage.stats,
            deadline,
        )
    }

    pub fn ship(&self, batch: LogBatch) -> Result<ShipResponse, ShipError> {
        if batch.batch_id.is_empty() {
            return Err(ShipError::MissingBatchId);
        }

        // held for the whole batch so concurrent retries of one id cannot both submit
        #[allow(clippy::expect_used)]
        let mut recent = self.recent.lock().expect("lock poisoned");
        let mut mask = recent
            .settled
            .get(&batch.batch_id)
            .cloned()
            .unwrap_or_default();
        mask.resize(batch.entries.len(), false);

        let mut response = ShipResponse::default();
        for (index, entry) in batch.entries.into_iter().enumerate() {
            if mask[index] {
                response.duplicate += 1;
                continue;
            }
            let result = LabelSet::from_pairs(&entry.labels)
                .map_err(IngestError::from)
                .and_then(|labels| {
                    self.handle.submit(Event::log(
                        entry.timestamp.unwrap_or_else(now_millis),
                        labels,
                        entry.message,
                        entry.fields,
                    ))
                });
            match result {
                Ok(()) => {
                    response.accepted += 1;
                    mask[index] = true;
                }
                Err(e) => {
                    let retryable = matches!(e, IngestError::BufferFull);
                    mask[index] = !retryable;
                    response.rejected += 1;
                    response.rejections.push(Rejection {
                        index,
                        reason: e.to_string(),
                        retryable,
                    });
                }
            }
        }

        debug!(
            batch_id = %batch.batch_id,
            accepted = response.accepted,
            rejected = response.rejected,
            duplicate = response.duplicate,
            "Shipped log batch"
        );
        recent.remember(&batch.batch_id, mask);
        Ok(response)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::aggregator::MetricAggregator;
    use crate::constants::DEFAULT_HISTOGRAM_BUCKETS;
    use crate::event::TimeRange;
    use crate::index::LabelIndex;
    use crate::ingest::IngestService;
    use crate::labels::EMPTY_LABELS;
    use crate::log_store::LogStore;
    use crate::stats::PipelineStats;
    use std::sync::Arc;

    fn setup(capacity: usize, window: usize) -> (Gateway, IngestService, Storage) {
        let storage = Storage {
            index: Arc::new(LabelIndex::new(100)),
            aggregator: Arc::new(MetricAggregator::new(&DEFAULT_HISTOGRAM_BUCKETS)),
            logs: Arc::new(LogStore::new()),
            stats: Arc::new(PipelineStats::new()),
        };
        let (service, handle) = IngestService::new(capacity, storage.clone(), EMPTY_LABELS);
        (Gateway::new(handle, storage.clone(), window), service, storage)
    }

    fn batch(id: &str, n: usize) -> LogBatch {
        LogBatch {
            batch_id: id.to_string(),
            entries: (0..n)
                .map(|i| LogEntry {
                    timestamp: Some(i as Timestamp),
                    labels: BTreeMap::from([("job".to_string(), "shipper".to_string())]),
                    message: format!("line {i}"),
                    fields: Fields::new(),
                })
                .collect(),
        }
    }

    fn stored(storage: &Storage) -> usize {
        storage
            .logs
            .query(&storage.index, &[], TimeRange::new(0, 1_000).unwrap())
            .count()
    }

    #[tokio::test]
    async fn test_ship_same_batch_twice_stores_once() {
        let (gateway, service, storage) = setup(64, 16);
        let service_task = tokio::spawn(service.run());

        let first = gateway.ship(batch("b-1", 3)).unwrap();
        assert_eq!(first.accepted, 3);
        let second = gateway.ship(batch("b-1", 3)).unwrap();
        assert_eq!(second.accepted, 0);
        assert_eq!(second.duplicate, 3);

        gateway.handle.sync().await.unwrap();
        assert_eq!(stored(&storage), 3);

        gateway.handle.shutdown().await.unwrap();
        service_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_only_resubmits_transient_rejections() {
        let (gateway, service, storage) = setup(2, 16);

        let first = gateway.ship(batch("b-1", 3)).unwrap();
        assert_eq!(first.accepted, 2);
        assert_eq!(first.rejected, 1);
        assert!(first.has_retryable());
        assert_eq!(first.rejections[0].index, 2);

        let service_task = tokio::spawn(service.run());
        gateway.handle.sync().await.unwrap();

        let retry = gateway.ship(batch("b-1", 3)).unwrap();
        assert_eq!(retry.accepted, 1);
        assert_eq!(retry.duplicate, 2);
        gateway.handle.sync().await.unwrap();
        assert_eq!(stored(&storage), 3);

        gateway.handle.shutdown().await.unwrap();
        service_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_permanent_rejection_is_settled() {
        let (gateway, _service, _storage) = setup(64, 16);
        let mut bad = batch("b-1", 1);
        bad.entries[0].labels.insert(String::new(), "x".to_string());
        let first = gateway.ship(bad.clone()).unwrap();
        assert_eq!(first.rejected, 1);
        assert!(!first.has_retryable());
        let second = gateway.ship(bad).unwrap();
        assert_eq!(second.duplicate, 1);
        assert_eq!(second.rejected, 0);
    }

    #[tokio::test]
    async fn test_recent_batch_memory_is_bounded() {
        let (gateway, _service, _storage) = setup(64, 2);
        gateway.ship(batch("a", 1)).unwrap();
        gateway.ship(batch("b", 1)).unwrap();
        gateway.ship(batch("c", 1)).unwrap();
        // "a" fell out of the window
        assert_eq!(gateway.ship(batch("a", 1)).unwrap().accepted, 1);
        assert_eq!(gateway.ship(batch("c", 1)).unwrap().duplicate, 1);
        let recent = gateway.recent.lock().unwrap();
        assert_eq!(recent.order.len(), 2);
        assert_eq!(recent.settled.len(), 2);
    }

    #[test]
    fn test_batch_codec() {
        let original = batch("b-7", 2);
        let compressed = original.encode(3).unwrap();
        assert_eq!(LogBatch::decode(&compressed, true).unwrap(), original);

        let json = br#"{"batch_id":"b-8","entries":[{"message":"hi","labels":{"level":"INFO"},"fields":{"n":1}}]}"#;
        let plain = LogBatch::decode(json, false).unwrap();
        assert_eq!(plain.entries[0].timestamp, None);
        assert_eq!(plain.entries[0].fields.len(), 1);
        assert!(LogBatch::decode(b"not json", false).is_err());
        assert!(LogBatch::decode(json, true).is_err());
    }

    #[tokio::test]
    async fn test_missing_batch_id() {
        let (gateway, _service, _storage) = setup(4, 4);
        assert_eq!(gateway.ship(batch("", 1)), Err(ShipError::MissingBatchId));
    }

    #[tokio::test]
    async fn test_scrape_reports_counter() {
        let (gateway, service, _storage) = setup(64, 4);
        let service_task = tokio::spawn(service.run());
        let labels = LabelSet::metric(
            "http_requests_total",
            &LabelSet::parse("endpoint:/products").unwrap(),
        )
        .unwrap();
        for ts in 0..3 {
            gateway
                .handle
                .submit(Event {
                    timestamp: ts,
                    labels: labels.clone(),
                    payload: crate::event::Payload::Counter(1.0),
                })
                .unwrap();
        }
        gateway.handle.sync().await.unwrap();

        let text = gateway.scrape(None).unwrap();
        assert!(text.starts_with("http_requests_total{endpoint=\"/products\"} 3\n"));
        assert!(text.contains("pipeline_events_accepted_total 3\n"));

        gateway.handle.shutdown().await.unwrap();
        service_task.await.unwrap();
    }
}
