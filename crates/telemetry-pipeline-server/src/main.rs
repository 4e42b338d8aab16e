// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use telemetry_pipeline_server::config::ServerConfig;
use telemetry_pipeline_server::logger;
use telemetry_pipeline_server::server::PipelineServer;

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("PIPELINE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    if let Err(e) = logger::init(&log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on pipeline server startup: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match PipelineServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Error creating pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };
    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutting down pipeline server");
        shutdown_token.cancel();
    });

    match server.run(listener, cancel_token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Pipeline server stopped: {e}");
            ExitCode::FAILURE
        }
    }
}
