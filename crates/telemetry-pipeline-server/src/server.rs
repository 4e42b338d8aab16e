// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the pipeline to its listeners and background tasks.

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use telemetry_pipeline::event::now_millis;
use telemetry_pipeline::ingest::IngestService;
use telemetry_pipeline::pipeline::Pipeline;
use telemetry_pipeline::statsd::{StatsdConfig, StatsdListener};

use crate::api::{self, ApiConfig};
use crate::config::ServerConfig;
use crate::error::ServerError;

pub struct PipelineServer {
    config: ServerConfig,
    pipeline: Pipeline,
    service: IngestService,
}

impl PipelineServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let (pipeline, service) = Pipeline::new(config.pipeline_config())?;
        Ok(Self {
            config,
            pipeline,
            service,
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Binds the HTTP listener on the configured host and port.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.http_port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{addr}: {e}")))
    }

    /// Runs until `cancel_token` fires, then drains the ingest buffer.
    pub async fn run(
        self,
        listener: TcpListener,
        cancel_token: CancellationToken,
    ) -> Result<(), ServerError> {
        let statsd_listener = if self.config.use_statsd {
            let producer = self
                .pipeline
                .producer()
                .with_namespace(self.config.metric_namespace.clone());
            let statsd_config = StatsdConfig {
                host: self.config.host.clone(),
                port: self.config.statsd_port,
            };
            let listener = StatsdListener::new(&statsd_config, producer, cancel_token.clone())
                .await
                .map_err(|e| {
                    ServerError::Bind(format!(
                        "statsd {}:{}: {e}",
                        statsd_config.host, statsd_config.port
                    ))
                })?;
            Some(listener)
        } else {
            info!("statsd disabled");
            None
        };

        // nothing is spawned until every socket is bound
        let service_handle = tokio::spawn(self.service.run());
        let statsd_handle = statsd_listener.map(|listener| {
            if let Some(addr) = listener.local_addr() {
                info!("statsd-udp: starting to listen on {addr}");
            }
            tokio::spawn(listener.spin())
        });

        let compaction_handle = tokio::spawn(compact_periodically(
            self.pipeline.clone(),
            self.config.compaction_interval,
            cancel_token.clone(),
        ));

        if let Ok(addr) = listener.local_addr() {
            info!("http: starting to listen on {addr}");
        }
        let api_config = ApiConfig {
            query_timeout: self.config.query_timeout,
            max_request_bytes: self.config.max_request_bytes,
        };
        let served = api::serve(
            listener,
            self.pipeline.clone(),
            api_config,
            cancel_token.clone(),
        )
        .await;

        // stop the other tasks too when the HTTP server fails
        cancel_token.cancel();
        if let Some(handle) = statsd_handle {
            if let Err(e) = handle.await {
                error!("Statsd listener task failed: {e}");
            }
        }
        if let Err(e) = compaction_handle.await {
            error!("Compaction task failed: {e}");
        }
        if let Err(e) = self.pipeline.shutdown().await {
            error!("Failed to stop ingest service: {e}");
        }
        service_handle
            .await
            .map_err(|e| ServerError::Runtime(format!("ingest service task failed: {e}")))?;
        served
    }
}

async fn compact_periodically(pipeline: Pipeline, every: Duration, cancel_token: CancellationToken) {
    let mut ticker = interval(every);
    ticker.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let compaction = pipeline.compact(now_millis());
                if compaction.log_lines > 0 || compaction.metric_samples > 0 {
                    debug!(
                        "Compacted {} log lines and {} metric samples",
                        compaction.log_lines, compaction.metric_samples
                    );
                }
            }
        }
    }
}
