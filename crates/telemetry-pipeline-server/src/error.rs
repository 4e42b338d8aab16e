// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use telemetry_pipeline::errors::Creation;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to bind {0}")]
    Bind(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl From<Creation> for ServerError {
    fn from(e: Creation) -> Self {
        match e {
            Creation::InvalidConfig(msg) => ServerError::InvalidConfig(msg),
        }
    }
}
