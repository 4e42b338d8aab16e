// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical label sets.
//!
//! A [`LabelSet`] is kept sorted by key with unique keys, so two sets built from the same pairs
//! in any order compare, hash and display identically. Series identity is derived from it.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ustr::Ustr;

use crate::constants::{MAX_LABELS, METRIC_NAME_LABEL};
use crate::errors::ParseError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelSet {
    values: Vec<(Ustr, Ustr)>,
}

pub const EMPTY_LABELS: LabelSet = LabelSet { values: Vec::new() };

impl LabelSet {
    /// Builds a canonical label set. Exact duplicates collapse; a key repeated with a different
    /// value is rejected.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut values = Vec::new();
        for (key, value) in pairs {
            let key = key.as_ref();
            if key.is_empty() {
                return Err(ParseError::EmptyLabelName);
            }
            values.push((Ustr::from(key), Ustr::from(value.as_ref())));
        }
        Self::canonicalize(values)
    }

    /// Parses the statsd tag syntax `key:value,key2:value2`. A bare `tag` gets an empty value.
    pub fn parse(tags_section: &str) -> Result<Self, ParseError> {
        let pairs = tags_section
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once(':') {
                Some((key, value)) => (key, value),
                None => (part, ""),
            });
        Self::from_pairs(pairs)
    }

    /// Label set of a metric series: `labels` plus the metric name.
    pub fn metric(name: &str, labels: &LabelSet) -> Result<Self, ParseError> {
        let mut values = labels.values.clone();
        values.retain(|(k, _)| k.as_str() != METRIC_NAME_LABEL);
        values.push((Ustr::from(METRIC_NAME_LABEL), Ustr::from(name)));
        Self::canonicalize(values)
    }

    fn canonicalize(mut values: Vec<(Ustr, Ustr)>) -> Result<Self, ParseError> {
        values.sort_unstable();
        values.dedup();
        if let Some(w) = values.windows(2).find(|w| w[0].0 == w[1].0) {
            return Err(ParseError::DuplicateLabel(w[0].0.to_string()));
        }
        if values.len() > MAX_LABELS {
            return Err(ParseError::TooManyLabels(MAX_LABELS));
        }
        Ok(Self { values })
    }

    /// Returns a new set with `other` layered on top; `other` wins on key conflicts.
    pub fn merge(&self, other: &LabelSet) -> Result<Self, ParseError> {
        if other.is_empty() {
            return Ok(self.clone());
        }
        let mut values: Vec<(Ustr, Ustr)> = self
            .values
            .iter()
            .filter(|(k, _)| other.get(k.as_str()).is_none())
            .copied()
            .collect();
        values.extend(other.values.iter().copied());
        Self::canonicalize(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.values[i].1.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Metric name, when this is a metric series.
    pub fn name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn interned(&self) -> &[(Ustr, Ustr)] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Escapes a label value for the text exposition format.
pub(crate) fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Writes `{k="v",...}` for every label except the metric name, plus `extra` pairs at the end.
/// Nothing is written when there are no labels to show.
pub(crate) fn write_label_block(
    f: &mut impl fmt::Write,
    labels: &LabelSet,
    extra: &[(&str, &str)],
) -> fmt::Result {
    let mut pairs = labels
        .iter()
        .filter(|(k, _)| *k != METRIC_NAME_LABEL)
        .chain(extra.iter().copied())
        .peekable();
    if pairs.peek().is_none() {
        return Ok(());
    }
    f.write_char('{')?;
    let mut first = true;
    for (k, v) in pairs {
        if !first {
            f.write_char(',')?;
        }
        first = false;
        write!(f, "{k}=\"{}\"", escape_label_value(v))?;
    }
    f.write_char('}')
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.name() {
            f.write_str(name)?;
        }
        if self.values.is_empty() {
            return f.write_str("{}");
        }
        write_label_block(f, self, &[])
    }
}

impl Serialize for LabelSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (k, v) in self.iter() {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for LabelSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = BTreeMap::<String, String>::deserialize(deserializer)?;
        LabelSet::from_pairs(map).map_err(D::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent() {
        let a = LabelSet::from_pairs([("env", "prod"), ("service", "web")]).unwrap();
        let b = LabelSet::from_pairs([("service", "web"), ("env", "prod")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_exact_duplicates_collapse() {
        let labels = LabelSet::parse("env:prod,env:prod,service:web").unwrap();
        assert_eq!(labels.len(), 2);
    }

    #[test]
    fn test_conflicting_duplicate_rejected() {
        let err = LabelSet::parse("env:prod,env:dev").unwrap_err();
        assert_eq!(err, ParseError::DuplicateLabel("env".to_string()));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert_eq!(
            LabelSet::from_pairs([("", "x")]).unwrap_err(),
            ParseError::EmptyLabelName
        );
    }

    #[test]
    fn test_too_many_labels() {
        let pairs: Vec<(String, String)> = (0..=MAX_LABELS)
            .map(|i| (format!("k{i}"), "v".to_string()))
            .collect();
        assert_eq!(
            LabelSet::from_pairs(pairs).unwrap_err(),
            ParseError::TooManyLabels(MAX_LABELS)
        );
    }

    #[test]
    fn test_parse_bare_tag() {
        let labels = LabelSet::parse("debug,env:prod").unwrap();
        assert_eq!(labels.get("debug"), Some(""));
        assert_eq!(labels.get("env"), Some("prod"));
        assert_eq!(labels.get("missing"), None);
    }

    #[test]
    fn test_merge_overrides() {
        let base = LabelSet::parse("env:prod,region:eu").unwrap();
        let bound = LabelSet::parse("env:dev,request_id:abc").unwrap();
        let merged = base.merge(&bound).unwrap();
        assert_eq!(merged.get("env"), Some("dev"));
        assert_eq!(merged.get("region"), Some("eu"));
        assert_eq!(merged.get("request_id"), Some("abc"));
    }

    #[test]
    fn test_metric_display() {
        let labels = LabelSet::parse("endpoint:/products").unwrap();
        let series = LabelSet::metric("http_requests_total", &labels).unwrap();
        assert_eq!(series.name(), Some("http_requests_total"));
        assert_eq!(
            series.to_string(),
            "http_requests_total{endpoint=\"/products\"}"
        );
        let bare = LabelSet::metric("up", &EMPTY_LABELS).unwrap();
        assert_eq!(bare.to_string(), "up");
    }

    #[test]
    fn test_escape_label_value() {
        assert_eq!(escape_label_value("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }

    #[test]
    fn test_serde_as_map() {
        let labels = LabelSet::parse("level:ERROR,service:api").unwrap();
        let json = serde_json::to_string(&labels).unwrap();
        assert_eq!(json, r#"{"level":"ERROR","service":"api"}"#);
        let back: LabelSet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, labels);
    }
}
