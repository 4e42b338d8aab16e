// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP endpoints of the pipeline.
//!
//! | method | path         | body                                   |
//! |--------|--------------|----------------------------------------|
//! | GET    | `/metrics`   | text exposition of the current metrics |
//! | POST   | `/logs/ship` | JSON `LogBatch`, optionally zstd       |
//! | POST   | `/query`     | JSON [`QueryRequest`]                  |
//! | GET    | `/search`    | metric names, or `?label=key` values   |
//! | GET    | `/health`    |                                        |

use std::borrow::Cow;
use std::io;
use std::string::FromUtf8Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use telemetry_pipeline::constants::EXPOSITION_CONTENT_TYPE;
use telemetry_pipeline::errors::{QueryError, ScrapeError};
use telemetry_pipeline::event::{LogLine, Timestamp};
use telemetry_pipeline::gateway::LogBatch;
use telemetry_pipeline::matcher::parse_selector;
use telemetry_pipeline::pipeline::Pipeline;
use telemetry_pipeline::query::{Op, Query, QueryResult, SeriesResult, Target};
use telemetry_pipeline::shipper::SHIP_PATH;

use crate::error::ServerError;
use crate::http_utils::{
    is_zstd_encoded, json_response, log_and_create_http_response, read_body, text_response,
    verify_request_content_length, HttpResponse,
};

pub const METRICS_ENDPOINT_PATH: &str = "/metrics";
pub const QUERY_ENDPOINT_PATH: &str = "/query";
pub const SEARCH_ENDPOINT_PATH: &str = "/search";
pub const HEALTH_ENDPOINT_PATH: &str = "/health";

pub struct ApiConfig {
    pub query_timeout: Duration,
    pub max_request_bytes: usize,
}

struct ApiState {
    pipeline: Pipeline,
    config: ApiConfig,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    /// `name{key="value",...}`; empty matches every series
    #[serde(default)]
    pub selector: String,
    pub start: Timestamp,
    pub end: Timestamp,
    /// `raw`, `rate`, `sum`, `avg`, `count` or `quantile(p)`
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub step: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize)]
struct QueryResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    series: Option<Vec<SeriesResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    logs: Option<Vec<LogLine>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl QueryResponse {
    fn with_result(mut self, result: QueryResult) -> Self {
        match result {
            QueryResult::Series(series) => {
                self.result_type = Some("series");
                self.series = Some(series);
            }
            QueryResult::Logs(logs) => {
                self.result_type = Some("logs");
                self.logs = Some(logs);
            }
        }
        self
    }

    fn error(message: String) -> Self {
        Self {
            status: "error",
            error: Some(message),
            ..Default::default()
        }
    }
}

impl QueryRequest {
    fn into_query(self, deadline: Instant) -> Result<Query, QueryError> {
        let matchers = parse_selector(&self.selector)?;
        let op = match self.op.as_deref() {
            Some(op) => op.parse::<Op>()?,
            None => Op::Raw,
        };
        let mut query = match self.target {
            Target::Metrics => Query::metrics(matchers, self.start, self.end, op),
            Target::Logs => Query::logs(matchers, self.start, self.end).with_op(op),
        }
        .with_deadline(deadline);
        if let Some(step) = self.step {
            query = query.with_step(step);
        }
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }
        Ok(query)
    }
}

/// Accepts connections on `listener` until `cancel_token` fires.
pub async fn serve(
    listener: TcpListener,
    pipeline: Pipeline,
    config: ApiConfig,
    cancel_token: CancellationToken,
) -> Result<(), ServerError> {
    let state = Arc::new(ApiState { pipeline, config });
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { endpoint_handler(&state, req).await }
    });

    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = cancel_token.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(ServerError::Runtime(e.to_string()));
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(async move {
            if let Err(e) = server.serve_connection(conn, service).await {
                debug!("Connection error: {e}");
            }
        });
    }

    joinset.shutdown().await;
    debug!("HTTP server stopped");
    Ok(())
}

async fn endpoint_handler(state: &ApiState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, METRICS_ENDPOINT_PATH) => metrics_handler(state),
        (&Method::POST, SHIP_PATH) => ship_handler(state, req).await,
        (&Method::POST, QUERY_ENDPOINT_PATH) => query_handler(state, req).await,
        (&Method::GET, SEARCH_ENDPOINT_PATH) => search_handler(state, req.uri().query()),
        (&Method::GET, HEALTH_ENDPOINT_PATH) => {
            json_response(StatusCode::OK, &serde_json::json!({ "status": "ok" }))
        }
        _ => log_and_create_http_response(
            &format!("Not found: {} {}", req.method(), req.uri().path()),
            StatusCode::NOT_FOUND,
        ),
    }
}

fn metrics_handler(state: &ApiState) -> http::Result<HttpResponse> {
    let deadline = Instant::now() + state.config.query_timeout;
    match state.pipeline.gateway().scrape(Some(deadline)) {
        Ok(body) => text_response(StatusCode::OK, EXPOSITION_CONTENT_TYPE, body),
        Err(ScrapeError::DeadlineExceeded { partial }) => {
            error!("Scrape deadline exceeded, returning partial snapshot");
            text_response(StatusCode::GATEWAY_TIMEOUT, EXPOSITION_CONTENT_TYPE, partial)
        }
    }
}

async fn ship_handler(state: &ApiState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    let (parts, body) = req.into_parts();
    let limit = state.config.max_request_bytes;
    if let Some(response) = verify_request_content_length(&parts.headers, limit, "Error shipping logs")
    {
        return response;
    }
    let body = match read_body(body, limit, "Error shipping logs").await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let batch = match LogBatch::decode(&body, is_zstd_encoded(&parts.headers)) {
        Ok(batch) => batch,
        Err(e) => {
            return log_and_create_http_response(
                &format!("Error shipping logs: {e}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };
    match state.pipeline.gateway().ship(batch) {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => log_and_create_http_response(
            &format!("Error shipping logs: {e}"),
            StatusCode::BAD_REQUEST,
        ),
    }
}

async fn query_handler(state: &ApiState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    let deadline = Instant::now() + state.config.query_timeout;
    let (parts, body) = req.into_parts();
    let limit = state.config.max_request_bytes;
    if let Some(response) = verify_request_content_length(&parts.headers, limit, "Error querying")
    {
        return response;
    }
    let body = match read_body(body, limit, "Error querying").await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let request: QueryRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &QueryResponse::error(format!("invalid query request: {e}")),
            )
        }
    };
    let result = request
        .into_query(deadline)
        .and_then(|query| state.pipeline.query(&query));
    match result {
        Ok(result) => json_response(
            StatusCode::OK,
            &QueryResponse {
                status: "success",
                ..Default::default()
            }
            .with_result(result),
        ),
        Err(QueryError::DeadlineExceeded { partial }) => {
            error!("Query deadline exceeded, returning partial result");
            json_response(
                StatusCode::GATEWAY_TIMEOUT,
                &QueryResponse::error("query deadline exceeded".to_string()).with_result(*partial),
            )
        }
        Err(e) => {
            debug!("Rejected query: {e}");
            json_response(StatusCode::BAD_REQUEST, &QueryResponse::error(e.to_string()))
        }
    }
}

/// Percent-decoded value of `name` in a URL query string.
fn query_param(query_string: &str, name: &str) -> Option<Result<String, FromUtf8Error>> {
    query_string
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| urlencoding::decode(value).map(Cow::into_owned))
}

fn search_handler(state: &ApiState, query_string: Option<&str>) -> http::Result<HttpResponse> {
    let label = match query_string.and_then(|qs| query_param(qs, "label")).transpose() {
        Ok(label) => label,
        Err(e) => {
            return log_and_create_http_response(
                &format!("Error searching: invalid label parameter: {e}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };
    let engine = state.pipeline.query_engine();
    let values = match label {
        Some(key) => engine.label_values(&key),
        None => engine.metric_names(),
    };
    json_response(StatusCode::OK, &values)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request(json: &str) -> QueryRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_query_request_defaults() {
        let query = request(r#"{"start":0,"end":10}"#)
            .into_query(Instant::now())
            .unwrap();
        assert_eq!(query.op, Op::Raw);
        assert_eq!(query.target, Target::Metrics);
        assert!(query.matchers.is_empty());
        assert!(query.deadline.is_some());
    }

    #[test]
    fn test_query_request_full() {
        let query = request(
            r#"{"selector":"{level=\"ERROR\"}","start":0,"end":10,"op":"count","target":"logs","limit":5}"#,
        )
        .into_query(Instant::now())
        .unwrap();
        assert_eq!(query.op, Op::Count);
        assert_eq!(query.target, Target::Logs);
        assert_eq!(query.matchers.len(), 1);
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn test_query_request_errors() {
        assert!(matches!(
            request(r#"{"start":0,"end":10,"op":"median"}"#).into_query(Instant::now()),
            Err(QueryError::UnsupportedOp(_))
        ));
        assert!(matches!(
            request(r#"{"selector":"{a=~\"(\"}","start":0,"end":10}"#).into_query(Instant::now()),
            Err(QueryError::InvalidMatcher(_))
        ));
    }

    #[test]
    fn test_query_param_is_percent_decoded() {
        assert_eq!(
            query_param("x=1&label=a%3Ab", "label").unwrap().unwrap(),
            "a:b"
        );
        assert_eq!(query_param("label=env", "label").unwrap().unwrap(), "env");
        assert!(query_param("other=1", "label").is_none());
        assert!(query_param("label=%FF", "label").unwrap().is_err());
    }

    #[test]
    fn test_error_response_shape() {
        let body = serde_json::to_string(&QueryResponse::error("boom".to_string())).unwrap();
        assert_eq!(body, r#"{"status":"error","error":"boom"}"#);
    }
}
