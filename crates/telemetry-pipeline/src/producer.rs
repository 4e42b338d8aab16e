// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-facing calls: emit logs, bump counters, set gauges, observe histograms.
//!
//! A [`Producer`] is obtained from an explicitly constructed [`crate::pipeline::Pipeline`] and
//! passed to whoever needs it. [`Producer::bind`] returns a producer whose calls carry extra
//! labels, e.g. a request id for the lifetime of a request.

use crate::errors::{IngestError, ParseError};
use crate::event::{now_millis, Event, Fields, Payload, Timestamp};
use crate::ingest::IngestHandle;
use crate::labels::LabelSet;
use crate::stats::DropReason;
use crate::util::{is_valid_metric_name, namespaced};

#[derive(Clone)]
pub struct Producer {
    handle: IngestHandle,
    bound: LabelSet,
    namespace: Option<String>,
}

impl Producer {
    pub fn new(handle: IngestHandle) -> Self {
        Self {
            handle,
            bound: LabelSet::default(),
            namespace: None,
        }
    }

    /// Metric names emitted by this producer are prefixed with `namespace_`.
    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// A producer that adds `labels` to every call. Labels passed to a call win over bound ones.
    pub fn bind(&self, labels: &LabelSet) -> Result<Producer, ParseError> {
        Ok(Producer {
            handle: self.handle.clone(),
            bound: self.bound.merge(labels)?,
            namespace: self.namespace.clone(),
        })
    }

    pub fn bound_labels(&self) -> &LabelSet {
        &self.bound
    }

    fn reject(&self, error: ParseError) -> IngestError {
        self.handle.stats().record_dropped(DropReason::Invalid);
        error.into()
    }

    fn log_labels(&self, labels: &LabelSet) -> Result<LabelSet, IngestError> {
        self.bound.merge(labels).map_err(|e| self.reject(e))
    }

    fn metric_labels(&self, name: &str, labels: &LabelSet) -> Result<LabelSet, IngestError> {
        let name = namespaced(self.namespace.as_deref(), name);
        if !is_valid_metric_name(&name) {
            return Err(self.reject(ParseError::InvalidMetricName(name)));
        }
        self.bound
            .merge(labels)
            .and_then(|merged| LabelSet::metric(&name, &merged))
            .map_err(|e| self.reject(e))
    }

    /// Submits a fully built event, with the bound labels layered underneath its own.
    pub fn submit(&self, mut event: Event) -> Result<(), IngestError> {
        event.labels = self.log_labels(&event.labels)?;
        self.handle.submit(event)
    }

    pub fn emit_log(
        &self,
        labels: &LabelSet,
        message: impl Into<String>,
        fields: Fields,
    ) -> Result<(), IngestError> {
        let labels = self.log_labels(labels)?;
        self.handle
            .submit(Event::log(now_millis(), labels, message.into(), fields))
    }

    fn metric(
        &self,
        name: &str,
        labels: &LabelSet,
        timestamp: Timestamp,
        payload: Payload,
    ) -> Result<(), IngestError> {
        let labels = self.metric_labels(name, labels)?;
        self.handle.submit(Event {
            timestamp,
            labels,
            payload,
        })
    }

    pub fn increment_counter(&self, name: &str, labels: &LabelSet) -> Result<(), IngestError> {
        self.increment_counter_by(name, labels, 1.0)
    }

    /// Rejects negative deltas with [`IngestError::NegativeDeltaOnCounter`].
    pub fn increment_counter_by(
        &self,
        name: &str,
        labels: &LabelSet,
        delta: f64,
    ) -> Result<(), IngestError> {
        self.metric(name, labels, now_millis(), Payload::Counter(delta))
    }

    /// Marks a restart of the counting process; the counter starts over from zero.
    pub fn reset_counter(&self, name: &str, labels: &LabelSet) -> Result<(), IngestError> {
        self.metric(name, labels, now_millis(), Payload::CounterReset)
    }

    pub fn set_gauge(&self, name: &str, labels: &LabelSet, value: f64) -> Result<(), IngestError> {
        self.metric(name, labels, now_millis(), Payload::Gauge(value))
    }

    pub fn observe_histogram(
        &self,
        name: &str,
        labels: &LabelSet,
        value: f64,
    ) -> Result<(), IngestError> {
        self.metric(name, labels, now_millis(), Payload::Histogram(value))
    }

    /// Records a metric sample with an explicit timestamp.
    pub fn record_at(
        &self,
        name: &str,
        labels: &LabelSet,
        timestamp: Timestamp,
        payload: Payload,
    ) -> Result<(), IngestError> {
        self.metric(name, labels, timestamp, payload)
    }
}
