// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-contained log shipping and metrics aggregation pipeline.
//!
//! Producers submit [`event::Event`]s through a bounded [`ingest`] buffer. A single drain task
//! applies them to the [`index::LabelIndex`], the [`aggregator::MetricAggregator`] and the
//! [`log_store::LogStore`]. The [`query::QueryEngine`] answers bounded range queries over that
//! state, and the [`gateway::Gateway`] exposes the pull (scrape) and push (ship) sides.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod constants;
pub mod errors;
pub mod event;
pub mod exposition;
pub mod gateway;
pub mod index;
pub mod ingest;
pub mod labels;
pub mod log_store;
pub mod matcher;
pub mod pipeline;
pub mod producer;
pub mod query;
pub mod shipper;
pub mod stats;
pub mod statsd;
pub mod util;
