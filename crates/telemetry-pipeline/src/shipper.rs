// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client side of the ship endpoint.
//!
//! Entries are buffered with [`LogShipper::push`] and cut into batches on [`LogShipper::flush`].
//! Every batch gets its id once, when it is cut, so a batch that comes back from `flush` can be
//! handed to [`LogShipper::ship`] again later without the gateway storing it twice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, error};
use zstd::zstd_safe::CompressionLevel;

use crate::event::now_millis;
use crate::gateway::{LogBatch, LogEntry, ShipResponse};

pub const SHIP_PATH: &str = "/logs/ship";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Number of attempts, back to back.
    Immediate(u64),
    /// Number of attempts, and the delay in milliseconds that grows by itself after each one.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    fn attempts(&self) -> u64 {
        match self {
            RetryStrategy::Immediate(n) | RetryStrategy::LinearBackoff(n, _) => (*n).max(1),
        }
    }

    fn delay(&self, attempt: u64) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, ms) => {
                Some(Duration::from_millis(ms.saturating_mul(attempt)))
            }
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ShippingError {
    #[error("failed to prepare payload: {0}")]
    Payload(String),
    #[error("destination error {0:?}: {1}")]
    Destination(Option<StatusCode>, String),
}

impl ShippingError {
    /// 4xx answers and malformed payloads will not succeed on a resend.
    pub fn is_permanent(&self) -> bool {
        match self {
            ShippingError::Payload(_) => true,
            ShippingError::Destination(status, _) => status.is_some_and(|s| s.is_client_error()),
        }
    }
}

pub struct ShipperConfig {
    /// Base url of the pipeline server, e.g. `http://127.0.0.1:8001`.
    pub url: String,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub compression_level: CompressionLevel,
    pub max_batch_entries: usize,
    /// Prefix of generated batch ids. Defaults to one derived from the process id and start time.
    pub batch_id_prefix: Option<String>,
}

pub struct LogShipper {
    client: reqwest::Client,
    endpoint: String,
    retry_strategy: RetryStrategy,
    compression_level: CompressionLevel,
    max_batch_entries: usize,
    batch_id_prefix: String,
    next_batch: AtomicU64,
    pending: Mutex<Vec<LogEntry>>,
}

impl LogShipper {
    pub fn new(config: ShipperConfig) -> Result<Self, ShippingError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ShippingError::Destination(None, format!("failed to build client: {e}")))?;
        let batch_id_prefix = config
            .batch_id_prefix
            .unwrap_or_else(|| format!("{}-{}", std::process::id(), now_millis()));
        Ok(Self {
            client,
            endpoint: format!("{}{SHIP_PATH}", config.url.trim_end_matches('/')),
            retry_strategy: config.retry_strategy,
            compression_level: config.compression_level,
            max_batch_entries: config.max_batch_entries.max(1),
            batch_id_prefix,
            next_batch: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, entry: LogEntry) {
        #[allow(clippy::expect_used)]
        self.pending.lock().expect("lock poisoned").push(entry);
    }

    pub fn pending(&self) -> usize {
        #[allow(clippy::expect_used)]
        self.pending.lock().expect("lock poisoned").len()
    }

    fn next_batch_id(&self) -> String {
        let seq = self.next_batch.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq}", self.batch_id_prefix)
    }

    /// Cuts the pending entries into batches, each with a fresh id.
    pub fn take_batches(&self) -> Vec<LogBatch> {
        let entries = {
            #[allow(clippy::expect_used)]
            let mut pending = self.pending.lock().expect("lock poisoned");
            std::mem::take(&mut *pending)
        };
        entries
            .chunks(self.max_batch_entries)
            .map(|chunk| LogBatch {
                batch_id: self.next_batch_id(),
                entries: chunk.to_vec(),
            })
            .collect()
    }

    /// Ships everything pending. Returns the batches that failed transiently, ids intact, so the
    /// caller can ship them again. Batches after a transient failure are not attempted.
    pub async fn flush(&self) -> Vec<LogBatch> {
        let mut batches = self.take_batches().into_iter();
        let mut failed = Vec::new();
        let n_batches = batches.len();
        debug!("Flushing {n_batches} log batches");

        while let Some(batch) = batches.next() {
            match self.ship(&batch).await {
                Ok(response) if response.has_retryable() => {
                    error!(
                        "Log batch {} has entries the gateway could not take yet",
                        batch.batch_id
                    );
                    failed.push(batch);
                    failed.extend(batches.by_ref());
                }
                Ok(_) => {}
                Err(e) if e.is_permanent() => {
                    error!("Dropping log batch {}: {}", batch.batch_id, e);
                }
                Err(e) => {
                    error!("Error shipping log batch {}: {}", batch.batch_id, e);
                    failed.push(batch);
                    failed.extend(batches.by_ref());
                }
            }
        }
        failed
    }

    /// Posts `batch` until it is accepted, the retry strategy runs out, or the gateway answers
    /// with a 4xx. An accepted batch that still carries retryable rejections is resent as well.
    pub async fn ship(&self, batch: &LogBatch) -> Result<ShipResponse, ShippingError> {
        let body = batch
            .encode(self.compression_level)
            .map_err(|e| ShippingError::Payload(e.to_string()))?;
        let attempts = self.retry_strategy.attempts();
        let mut last_status = None;

        for attempt in 1..=attempts {
            let result = self
                .client
                .post(&self.endpoint)
                .header(CONTENT_TYPE, "application/json")
                .header(CONTENT_ENCODING, "zstd")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let response: ShipResponse = resp.json().await.map_err(|e| {
                        ShippingError::Destination(
                            Some(status),
                            format!("invalid ship response: {e}"),
                        )
                    })?;
                    if !response.has_retryable() || attempt == attempts {
                        return Ok(response);
                    }
                    debug!(
                        "Batch {} partially accepted, resending: attempt {attempt}",
                        batch.batch_id
                    );
                    last_status = Some(status);
                }
                Ok(resp) if resp.status().is_client_error() => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    return Err(ShippingError::Destination(Some(status), text));
                }
                Ok(resp) => {
                    debug!("{}: ship attempt {attempt} failed", resp.status());
                    last_status = Some(resp.status());
                }
                Err(e) => {
                    debug!("Ship attempt {attempt} failed: {e}");
                    last_status = e.status();
                }
            }

            if attempt < attempts {
                if let Some(delay) = self.retry_strategy.delay(attempt) {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(ShippingError::Destination(
            last_status,
            format!("Failed to send request after {attempts} attempts"),
        ))
    }
}
