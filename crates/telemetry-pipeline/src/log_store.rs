// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only log storage, one stream per series.
//!
//! Each stream sits behind its own mutex so appends to one series never wait on readers of
//! another. The outer map lock is only held to find or create a stream. Late lines are appended
//! as they come and the stream is re-sorted on the next read.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, RwLock};

use fnv::FnvBuildHasher;
use hashbrown::HashMap;

use crate::event::{LogLine, TimeRange, Timestamp};
use crate::index::{LabelIndex, SeriesId};
use crate::matcher::Matcher;

#[derive(Default)]
struct LogStream {
    lines: Vec<LogLine>,
    sorted: bool,
}

impl LogStream {
    fn push(&mut self, line: LogLine) {
        if let Some(last) = self.lines.last() {
            if line.timestamp < last.timestamp {
                self.sorted = false;
            }
        }
        self.lines.push(line);
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            // stable, so lines with equal timestamps keep arrival order
            self.lines.sort_by_key(|l| l.timestamp);
            self.sorted = true;
        }
    }

    fn range(&mut self, range: TimeRange) -> &[LogLine] {
        self.ensure_sorted();
        let lo = self.lines.partition_point(|l| l.timestamp < range.start);
        let hi = self.lines.partition_point(|l| l.timestamp <= range.end);
        &self.lines[lo..hi.max(lo)]
    }
}

#[derive(Default)]
pub struct LogStore {
    streams: RwLock<HashMap<SeriesId, Arc<Mutex<LogStream>>, FnvBuildHasher>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, series: SeriesId) -> Option<Arc<Mutex<LogStream>>> {
        #[allow(clippy::expect_used)]
        let streams = self.streams.read().expect("lock poisoned");
        streams.get(&series).cloned()
    }

    pub fn append(&self, series: SeriesId, line: LogLine) {
        let stream = match self.stream(series) {
            Some(stream) => stream,
            None => {
                #[allow(clippy::expect_used)]
                let mut streams = self.streams.write().expect("lock poisoned");
                Arc::clone(
                    streams
                        .entry(series)
                        .or_insert_with(|| Arc::new(Mutex::new(LogStream::default()))),
                )
            }
        };
        #[allow(clippy::expect_used)]
        stream.lock().expect("lock poisoned").push(line);
    }

    /// Lines of the given series with a timestamp inside `range`, ascending.
    ///
    /// Each stream is copied under its own lock and released before the next one is read; the
    /// merge itself runs lazily as the cursor is consumed.
    pub fn query_series(&self, series: &[SeriesId], range: TimeRange) -> LogCursor {
        let mut sources = Vec::with_capacity(series.len());
        for id in series {
            let Some(stream) = self.stream(*id) else {
                continue;
            };
            #[allow(clippy::expect_used)]
            let mut stream = stream.lock().expect("lock poisoned");
            let lines = stream.range(range);
            if !lines.is_empty() {
                sources.push((*id, lines.to_vec()));
            }
        }
        LogCursor::new(sources)
    }

    /// Lines of every series matching `matchers`, ascending by timestamp.
    pub fn query(&self, index: &LabelIndex, matchers: &[Matcher], range: TimeRange) -> LogCursor {
        let series = index.scan(matchers);
        self.query_series(&series, range)
    }

    /// Removes every line older than `cutoff` and returns how many were dropped. Streams left
    /// empty are released.
    pub fn truncate_before(&self, cutoff: Timestamp) -> usize {
        let streams: Vec<(SeriesId, Arc<Mutex<LogStream>>)> = {
            #[allow(clippy::expect_used)]
            let streams = self.streams.read().expect("lock poisoned");
            streams.iter().map(|(k, v)| (*k, Arc::clone(v))).collect()
        };

        let mut removed = 0;
        let mut emptied = Vec::new();
        for (series, stream) in streams {
            #[allow(clippy::expect_used)]
            let mut stream = stream.lock().expect("lock poisoned");
            stream.ensure_sorted();
            let split = stream.lines.partition_point(|l| l.timestamp < cutoff);
            stream.lines.drain(..split);
            removed += split;
            if stream.lines.is_empty() {
                emptied.push(series);
            }
        }

        if !emptied.is_empty() {
            #[allow(clippy::expect_used)]
            let mut streams = self.streams.write().expect("lock poisoned");
            for series in emptied {
                // an append may have landed since the stream was drained
                let still_empty = streams.get(&series).is_some_and(|s| {
                    s.lock().map(|s| s.lines.is_empty()).unwrap_or(false)
                });
                if still_empty {
                    streams.remove(&series);
                }
            }
        }
        removed
    }

    /// Total number of stored lines.
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let streams = self.streams.read().expect("lock poisoned");
        streams
            .values()
            .map(|s| s.lock().map(|s| s.lines.len()).unwrap_or_default())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Head {
    timestamp: Timestamp,
    series: SeriesId,
    source: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp, self.series).cmp(&(other.timestamp, other.series))
    }
}

/// Lazy k-way merge over per-series snapshots. Ties on timestamp are broken by series creation
/// order, then by arrival order within the series.
pub struct LogCursor {
    sources: Vec<std::vec::IntoIter<LogLine>>,
    peeked: Vec<Option<LogLine>>,
    heap: BinaryHeap<Reverse<Head>>,
}

impl LogCursor {
    fn new(sources: Vec<(SeriesId, Vec<LogLine>)>) -> Self {
        let mut cursor = LogCursor {
            sources: Vec::with_capacity(sources.len()),
            peeked: Vec::with_capacity(sources.len()),
            heap: BinaryHeap::with_capacity(sources.len()),
        };
        for (source, (series, lines)) in sources.into_iter().enumerate() {
            let mut iter = lines.into_iter();
            let first = iter.next();
            if let Some(line) = &first {
                cursor.heap.push(Reverse(Head {
                    timestamp: line.timestamp,
                    series,
                    source,
                }));
            }
            cursor.sources.push(iter);
            cursor.peeked.push(first);
        }
        cursor
    }
}

impl Iterator for LogCursor {
    type Item = LogLine;

    fn next(&mut self) -> Option<LogLine> {
        let Reverse(head) = self.heap.pop()?;
        let line = self.peeked[head.source].take()?;
        if let Some(next) = self.sources[head.source].next() {
            self.heap.push(Reverse(Head {
                timestamp: next.timestamp,
                series: head.series,
                source: head.source,
            }));
            self.peeked[head.source] = Some(next);
        }
        Some(line)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::Fields;
    use crate::labels::LabelSet;

    fn line(labels: &LabelSet, timestamp: Timestamp, message: &str) -> LogLine {
        LogLine {
            timestamp,
            labels: labels.clone(),
            message: message.to_string(),
            fields: Fields::new(),
        }
    }

    fn range(start: Timestamp, end: Timestamp) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    #[test]
    fn test_query_inclusive_and_sorted_regardless_of_arrival() {
        let index = LabelIndex::new(10);
        let store = LogStore::new();
        let labels = LabelSet::parse("service:api").unwrap();
        let id = index.resolve(&labels).unwrap();
        for ts in [50, 10, 40, 20, 30, 60, 5] {
            store.append(id, line(&labels, ts, &format!("m{ts}")));
        }

        let got: Vec<Timestamp> = store
            .query(&index, &[], range(10, 50))
            .map(|l| l.timestamp)
            .collect();
        assert_eq!(got, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn test_merge_across_series() {
        let index = LabelIndex::new(10);
        let store = LogStore::new();
        let error = LabelSet::parse("level:ERROR").unwrap();
        let info = LabelSet::parse("level:INFO").unwrap();
        let e = index.resolve(&error).unwrap();
        let i = index.resolve(&info).unwrap();
        store.append(i, line(&info, 3, "i3"));
        store.append(e, line(&error, 2, "e2"));
        store.append(i, line(&info, 1, "i1"));
        store.append(e, line(&error, 3, "e3"));

        let got: Vec<String> = store
            .query(&index, &[], range(0, 10))
            .map(|l| l.message)
            .collect();
        assert_eq!(got, vec!["i1", "e2", "e3", "i3"]);

        let errors: Vec<String> = store
            .query(&index, &[Matcher::equal("level", "ERROR")], range(0, 10))
            .map(|l| l.message)
            .collect();
        assert_eq!(errors, vec!["e2", "e3"]);
    }

    #[test]
    fn test_cursor_is_restartable() {
        let index = LabelIndex::new(10);
        let store = LogStore::new();
        let labels = LabelSet::parse("a:b").unwrap();
        let id = index.resolve(&labels).unwrap();
        store.append(id, line(&labels, 1, "x"));
        store.append(id, line(&labels, 2, "y"));

        let mut first = store.query_series(&[id], range(0, 10));
        assert_eq!(first.next().map(|l| l.message), Some("x".to_string()));
        let second: Vec<String> = store.query_series(&[id], range(0, 10)).map(|l| l.message).collect();
        assert_eq!(second, vec!["x", "y"]);
        assert_eq!(first.next().map(|l| l.message), Some("y".to_string()));
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let index = LabelIndex::new(10);
        let store = LogStore::new();
        let labels = LabelSet::parse("a:b").unwrap();
        let id = index.resolve(&labels).unwrap();
        store.append(id, line(&labels, 5, "first"));
        store.append(id, line(&labels, 1, "early"));
        store.append(id, line(&labels, 5, "second"));
        let got: Vec<String> = store.query_series(&[id], range(0, 10)).map(|l| l.message).collect();
        assert_eq!(got, vec!["early", "first", "second"]);
    }

    #[test]
    fn test_truncate_before() {
        let index = LabelIndex::new(10);
        let store = LogStore::new();
        let a = LabelSet::parse("a:1").unwrap();
        let b = LabelSet::parse("a:2").unwrap();
        let ia = index.resolve(&a).unwrap();
        let ib = index.resolve(&b).unwrap();
        store.append(ia, line(&a, 1, "old"));
        store.append(ia, line(&a, 100, "new"));
        store.append(ib, line(&b, 2, "old"));

        assert_eq!(store.truncate_before(50), 2);
        assert_eq!(store.len(), 1);
        let got: Vec<String> = store
            .query_series(&[ia, ib], range(0, 1_000))
            .map(|l| l.message)
            .collect();
        assert_eq!(got, vec!["new"]);
    }
}
