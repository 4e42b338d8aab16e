// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Statsd-style UDP intake.
//!
//! Accepts datagrams of newline separated lines
//! `name:value|type[|@sample_rate][|#key:value,...][|T<unix_secs>]` where type is one of `c`,
//! `g`, `h`, `ms` or `d`. Names are sanitized into the metric name alphabet (`page.views`
//! becomes `page_views`). Timings (`ms`) are recorded as histogram observations in seconds.
//! Service checks (`_sc|`) and events (`_e{`) are ignored.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::errors::ParseError;
use crate::event::{Payload, Timestamp};
use crate::labels::LabelSet;
use crate::producer::Producer;
use crate::util::sanitize_metric_name;

// Max datagram size read at once; longer payloads are truncated by the socket.
const BUFFER_SIZE: usize = 8192;

pub struct StatsdConfig {
    /// Host to bind the UDP socket to (e.g., "127.0.0.1")
    pub host: String,
    /// Port to bind the UDP socket to (e.g., 8125); 0 picks a free port
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StatsdMetric {
    pub name: String,
    pub payload: Payload,
    pub labels: LabelSet,
    /// Milliseconds since the epoch, from the `T` section.
    pub timestamp: Option<Timestamp>,
}

/// Parses a single statsd line.
pub fn parse_line(line: &str) -> Result<StatsdMetric, ParseError> {
    let line = line.trim();
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| ParseError::Raw(format!("missing ':' in {line:?}")))?;
    if name.is_empty() {
        return Err(ParseError::InvalidMetricName(String::new()));
    }

    let mut sections = rest.split('|');
    let value_section = sections.next().unwrap_or_default();
    let value: f64 = value_section
        .parse()
        .map_err(|_| ParseError::Raw(format!("invalid value {value_section:?}")))?;
    if !value.is_finite() {
        return Err(ParseError::Raw(format!("non-finite value {value_section:?}")));
    }
    let kind = sections
        .next()
        .ok_or_else(|| ParseError::Raw(format!("missing type in {line:?}")))?;

    let mut sample_rate = 1.0;
    let mut labels = LabelSet::default();
    let mut timestamp = None;
    for section in sections {
        if let Some(rate) = section.strip_prefix('@') {
            sample_rate = rate
                .parse::<f64>()
                .ok()
                .filter(|r| *r > 0.0 && *r <= 1.0)
                .ok_or_else(|| ParseError::Raw(format!("invalid sample rate {rate:?}")))?;
        } else if let Some(tags) = section.strip_prefix('#') {
            labels = LabelSet::parse(tags)?;
        } else if let Some(secs) = section.strip_prefix('T') {
            let secs: i64 = secs
                .parse()
                .map_err(|_| ParseError::Raw(format!("invalid timestamp {secs:?}")))?;
            timestamp = Some(secs.saturating_mul(1_000));
        }
        // unknown sections (container ids, external data) are ignored
    }

    let payload = match kind {
        "c" => Payload::Counter(value / sample_rate),
        "g" => Payload::Gauge(value),
        "h" | "d" => Payload::Histogram(value),
        "ms" => Payload::Histogram(value / 1_000.0),
        other => return Err(ParseError::UnsupportedType(other.to_string())),
    };

    Ok(StatsdMetric {
        name: sanitize_metric_name(name),
        payload,
        labels,
        timestamp,
    })
}

// BufferReader abstracts where datagrams come from.
enum BufferReader {
    UdpSocket(UdpSocket),
    /// Replays a fixed buffer, for tests
    #[allow(dead_code)]
    MirrorTest(Vec<u8>, SocketAddr),
}

impl BufferReader {
    async fn read(&self) -> std::io::Result<(Vec<u8>, SocketAddr)> {
        match self {
            BufferReader::UdpSocket(socket) => {
                let mut buf = [0; BUFFER_SIZE];
                let (amt, src) = socket.recv_from(&mut buf).await?;
                Ok((buf[..amt].to_owned(), src))
            }
            BufferReader::MirrorTest(data, addr) => Ok((data.clone(), *addr)),
        }
    }
}

pub struct StatsdListener {
    cancel_token: CancellationToken,
    producer: Producer,
    buffer_reader: BufferReader,
}

impl StatsdListener {
    /// Binds the UDP socket. Metric names are namespaced by the producer, if it has one.
    pub async fn new(
        config: &StatsdConfig,
        producer: Producer,
        cancel_token: CancellationToken,
    ) -> std::io::Result<StatsdListener> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket = UdpSocket::bind(addr).await?;
        Ok(StatsdListener {
            cancel_token,
            producer,
            buffer_reader: BufferReader::UdpSocket(socket),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.buffer_reader {
            BufferReader::UdpSocket(socket) => socket.local_addr().ok(),
            BufferReader::MirrorTest(_, addr) => Some(*addr),
        }
    }

    /// Receives and ingests datagrams until cancelled.
    pub async fn spin(self) {
        debug!("Statsd listener started");
        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                () = self.consume_statsd() => {}
            }
        }
        debug!("Statsd listener stopped");
    }

    async fn consume_statsd(&self) {
        let (buf, src) = match self.buffer_reader.read().await {
            Ok(read) => read,
            Err(e) => {
                error!("Failed to receive statsd datagram: {}", e);
                return;
            }
        };
        let msgs = match std::str::from_utf8(&buf) {
            Ok(msgs) => msgs,
            Err(e) => {
                error!("Dropping non UTF-8 statsd datagram from {}: {}", src, e);
                return;
            }
        };
        trace!("Received message: {} from {}", msgs, src);
        self.insert_metrics(msgs);
    }

    fn insert_metrics(&self, msgs: &str) {
        let metrics = msgs
            .split('\n')
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.starts_with("_sc|") && !m.starts_with("_e{"))
            .filter_map(|m| match parse_line(m) {
                Ok(metric) => Some(metric),
                Err(e @ ParseError::UnsupportedType(_)) => {
                    debug!("Unsupported metric type: {}. {}", m, e);
                    None
                }
                Err(e) => {
                    error!("Failed to parse metric {}: {}", m, e);
                    None
                }
            });

        let mut inserted = 0;
        for metric in metrics {
            let timestamp = metric.timestamp.unwrap_or_else(crate::event::now_millis);
            match self
                .producer
                .record_at(&metric.name, &metric.labels, timestamp, metric.payload)
            {
                Ok(()) => inserted += 1,
                Err(e) => debug!("Dropping statsd metric {}: {}", metric.name, e),
            }
        }
        if inserted > 0 {
            debug!("Submitted {} statsd metrics", inserted);
        }
    }
}
