// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded intake queue and its single drain loop.
//!
//! Producers hold cloned [`IngestHandle`]s. A full buffer rejects the submission immediately
//! with [`IngestError::BufferFull`]; nothing blocks. [`IngestService::run`] drains commands in
//! order and applies each event to the index, the aggregator and the log store. Errors raised
//! there stop at this boundary: they are logged and counted in [`PipelineStats`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::aggregator::MetricAggregator;
use crate::errors::{AggregateError, IngestError};
use crate::event::{Event, LogLine, Payload};
use crate::index::LabelIndex;
use crate::labels::LabelSet;
use crate::log_store::LogStore;
use crate::stats::{DropReason, PipelineStats};

#[derive(Debug)]
pub enum IngestCommand {
    Event(Event),
    /// Answered once every command queued before it has been applied.
    Sync(oneshot::Sender<()>),
    Shutdown,
}

/// Shared state written by the drain loop and read by queries and scrapes.
#[derive(Clone)]
pub struct Storage {
    pub index: Arc<LabelIndex>,
    pub aggregator: Arc<MetricAggregator>,
    pub logs: Arc<LogStore>,
    pub stats: Arc<PipelineStats>,
}

#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestCommand>,
    stats: Arc<PipelineStats>,
}

impl IngestHandle {
    /// Queues `event` without waiting. Rejections are counted as dropped events.
    pub fn submit(&self, event: Event) -> Result<(), IngestError> {
        if let Err(e) = event.validate() {
            self.stats.record_dropped(DropReason::Invalid);
            return Err(e.into());
        }
        if let Payload::Counter(delta) = event.payload {
            if delta < 0.0 {
                self.stats.record_dropped(DropReason::NegativeDelta);
                return Err(IngestError::NegativeDeltaOnCounter(delta));
            }
        }
        match self.tx.try_send(IngestCommand::Event(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_dropped(DropReason::BufferFull);
                Err(IngestError::BufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IngestError::Closed),
        }
    }

    /// Waits until everything submitted before this call has been applied.
    pub async fn sync(&self) -> Result<(), IngestError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Sync(response_tx))
            .await
            .map_err(|_| IngestError::Closed)?;
        response_rx.await.map_err(|_| IngestError::Closed)
    }

    /// Asks the drain loop to stop once the commands queued before this one are applied.
    pub async fn shutdown(&self) -> Result<(), IngestError> {
        self.tx
            .send(IngestCommand::Shutdown)
            .await
            .map_err(|_| IngestError::Closed)
    }

    pub(crate) fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Free slots left in the buffer.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

pub struct IngestService {
    rx: mpsc::Receiver<IngestCommand>,
    storage: Storage,
    base_labels: LabelSet,
}

impl IngestService {
    /// `capacity` must be non-zero.
    pub fn new(
        capacity: usize,
        storage: Storage,
        base_labels: LabelSet,
    ) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = IngestHandle {
            tx,
            stats: Arc::clone(&storage.stats),
        };
        let service = Self {
            rx,
            storage,
            base_labels,
        };
        (service, handle)
    }

    pub async fn run(mut self) {
        debug!("Ingest service started");

        while let Some(command) = self.rx.recv().await {
            match command {
                IngestCommand::Event(event) => self.apply(event),
                IngestCommand::Sync(response_tx) => {
                    if response_tx.send(()).is_err() {
                        error!("Failed to send sync response - receiver dropped");
                    }
                }
                IngestCommand::Shutdown => {
                    debug!("Ingest service shutting down");
                    break;
                }
            }
        }

        debug!("Ingest service stopped");
    }

    fn apply(&self, event: Event) {
        let stats = &self.storage.stats;
        let labels = match self.base_labels.merge(&event.labels) {
            Ok(labels) => labels,
            Err(e) => {
                warn!("Dropping event with invalid labels: {}", e);
                stats.record_dropped(DropReason::Invalid);
                return;
            }
        };
        let series = match self.storage.index.resolve(&labels) {
            Ok(series) => series,
            Err(e) => {
                warn!("Dropping event for new series {}: {}", labels, e);
                stats.record_dropped(DropReason::SeriesLimit);
                return;
            }
        };

        let aggregator = &self.storage.aggregator;
        let timestamp = event.timestamp;
        let result = match event.payload {
            Payload::Log { message, fields } => {
                self.storage.logs.append(
                    series,
                    LogLine {
                        timestamp,
                        labels,
                        message,
                        fields,
                    },
                );
                Ok(())
            }
            Payload::Counter(delta) => aggregator.increment(series, timestamp, delta),
            Payload::CounterReset => aggregator.reset_counter(series, timestamp),
            Payload::Gauge(value) => aggregator.set(series, timestamp, value),
            Payload::Histogram(value) => aggregator.observe(series, timestamp, value),
        };

        match result {
            Ok(()) => stats.record_accepted(),
            Err(e @ AggregateError::KindConflict { .. }) => {
                warn!("Dropping sample: {}", e);
                stats.record_dropped(DropReason::KindConflict);
            }
            Err(e @ AggregateError::NegativeDeltaOnCounter { .. }) => {
                debug!("Dropping sample: {}", e);
                stats.record_dropped(DropReason::NegativeDelta);
            }
            Err(e @ AggregateError::NonFiniteValue(_)) => {
                debug!("Dropping sample: {}", e);
                stats.record_dropped(DropReason::Invalid);
            }
            Err(e @ AggregateError::SampleBeforeCompaction { .. }) => {
                warn!("Dropping sample: {}", e);
                stats.record_dropped(DropReason::LateSample);
            }
        }
    }
}
