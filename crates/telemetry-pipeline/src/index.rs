// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label index: canonical label set to series handle, plus inverted postings for scans.
//!
//! Series ids are assigned densely in creation order, so every postings list is sorted and a
//! scan returns handles in creation order.

use std::sync::RwLock;

use derive_more::{Display, Into};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use serde::Serialize;
use ustr::Ustr;

use crate::errors::IndexError;
use crate::labels::LabelSet;
use crate::matcher::Matcher;

/// Opaque handle of a series, stable for the process lifetime.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Into, Serialize,
)]
pub struct SeriesId(u64);

impl SeriesId {
    fn slot(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

#[derive(Default)]
struct Inner {
    by_labels: HashMap<LabelSet, SeriesId, FnvBuildHasher>,
    series: Vec<LabelSet>,
    postings: HashMap<(Ustr, Ustr), Vec<SeriesId>, FnvBuildHasher>,
    keys: HashMap<Ustr, Vec<SeriesId>, FnvBuildHasher>,
}

pub struct LabelIndex {
    inner: RwLock<Inner>,
    max_series: usize,
}

impl LabelIndex {
    pub fn new(max_series: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_series,
        }
    }

    /// Returns the handle for `labels`, creating the series on first use.
    pub fn resolve(&self, labels: &LabelSet) -> Result<SeriesId, IndexError> {
        {
            #[allow(clippy::expect_used)]
            let inner = self.inner.read().expect("lock poisoned");
            if let Some(id) = inner.by_labels.get(labels) {
                return Ok(*id);
            }
        }

        #[allow(clippy::expect_used)]
        let mut inner = self.inner.write().expect("lock poisoned");
        // another writer may have created it between the two locks
        if let Some(id) = inner.by_labels.get(labels) {
            return Ok(*id);
        }
        if inner.series.len() >= self.max_series {
            return Err(IndexError::SeriesLimitReached(self.max_series));
        }

        let id = SeriesId(inner.series.len() as u64);
        for &(key, value) in labels.interned() {
            inner.postings.entry((key, value)).or_default().push(id);
            inner.keys.entry(key).or_default().push(id);
        }
        inner.series.push(labels.clone());
        inner.by_labels.insert(labels.clone(), id);
        Ok(id)
    }

    /// Looks a series up without creating it.
    pub fn lookup(&self, labels: &LabelSet) -> Option<SeriesId> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.read().expect("lock poisoned");
        inner.by_labels.get(labels).copied()
    }

    pub fn labels(&self, id: SeriesId) -> Option<LabelSet> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.read().expect("lock poisoned");
        inner.series.get(id.slot()).cloned()
    }

    /// All series matching every matcher, in creation order.
    ///
    /// Candidates come from the shortest postings list among the matchers that require their
    /// key; the remaining matchers are checked against each candidate's labels.
    pub fn scan(&self, matchers: &[Matcher]) -> Vec<SeriesId> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.read().expect("lock poisoned");

        let mut narrowest: Option<&[SeriesId]> = None;
        for matcher in matchers.iter().filter(|m| m.requires_key()) {
            let list: &[SeriesId] = match matcher {
                Matcher::Equal(k, v) => inner
                    .postings
                    .get(&(*k, *v))
                    .map(Vec::as_slice)
                    .unwrap_or_default(),
                other => inner
                    .keys
                    .get(&other.key())
                    .map(Vec::as_slice)
                    .unwrap_or_default(),
            };
            if narrowest.map_or(true, |n| list.len() < n.len()) {
                narrowest = Some(list);
            }
        }

        let matches_all = |id: &SeriesId| {
            inner
                .series
                .get(id.slot())
                .is_some_and(|labels| matchers.iter().all(|m| m.matches(labels)))
        };

        match narrowest {
            Some(candidates) => candidates.iter().copied().filter(matches_all).collect(),
            None => (0..inner.series.len() as u64)
                .map(SeriesId)
                .filter(matches_all)
                .collect(),
        }
    }

    /// Distinct values of `key` across all series, sorted.
    pub fn label_values(&self, key: &str) -> Vec<String> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.read().expect("lock poisoned");
        let key = Ustr::from(key);
        let mut values: Vec<String> = inner
            .postings
            .keys()
            .filter(|(k, _)| *k == key)
            .map(|(_, v)| v.to_string())
            .collect();
        values.sort_unstable();
        values
    }

    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let inner = self.inner.read().expect("lock poisoned");
        inner.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(s: &str) -> LabelSet {
        LabelSet::parse(s).unwrap()
    }

    #[test]
    fn test_resolve_idempotent() {
        let index = LabelIndex::new(100);
        let a = index.resolve(&labels("env:prod,service:web")).unwrap();
        let b = index.resolve(&labels("service:web,env:prod")).unwrap();
        let c = index.resolve(&labels("service:api")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(index.len(), 2);
        assert_eq!(index.labels(a), Some(labels("env:prod,service:web")));
    }

    #[test]
    fn test_series_limit() {
        let index = LabelIndex::new(1);
        index.resolve(&labels("a:1")).unwrap();
        assert_eq!(
            index.resolve(&labels("a:2")),
            Err(IndexError::SeriesLimitReached(1))
        );
        // existing series still resolve
        assert!(index.resolve(&labels("a:1")).is_ok());
    }

    #[test]
    fn test_scan_exact_and_present() {
        let index = LabelIndex::new(100);
        let e1 = index.resolve(&labels("level:ERROR,service:api")).unwrap();
        let i1 = index.resolve(&labels("level:INFO,service:api")).unwrap();
        let e2 = index.resolve(&labels("level:ERROR,service:web")).unwrap();
        let other = index.resolve(&labels("service:db")).unwrap();

        assert_eq!(index.scan(&[Matcher::equal("level", "ERROR")]), vec![e1, e2]);
        assert_eq!(
            index.scan(&[
                Matcher::equal("level", "ERROR"),
                Matcher::equal("service", "web")
            ]),
            vec![e2]
        );
        assert_eq!(
            index.scan(&[Matcher::present("level")]),
            vec![e1, i1, e2]
        );
        assert_eq!(
            index.scan(&[Matcher::not_equal("level", "ERROR")]),
            vec![i1, other]
        );
        assert_eq!(index.scan(&[]), vec![e1, i1, e2, other]);
        assert!(index.scan(&[Matcher::equal("level", "WARN")]).is_empty());
    }

    #[test]
    fn test_scan_regex() {
        let index = LabelIndex::new(100);
        let a = index.resolve(&labels("endpoint:/products")).unwrap();
        let b = index.resolve(&labels("endpoint:/users")).unwrap();
        index.resolve(&labels("endpoint:/health")).unwrap();
        assert_eq!(
            index.scan(&[Matcher::regex("endpoint", "/(products|users)").unwrap()]),
            vec![a, b]
        );
    }

    #[test]
    fn test_label_values() {
        let index = LabelIndex::new(100);
        index.resolve(&labels("__name__:b_total")).unwrap();
        index.resolve(&labels("__name__:a_total,x:1")).unwrap();
        index.resolve(&labels("__name__:a_total,x:2")).unwrap();
        assert_eq!(index.label_values("__name__"), vec!["a_total", "b_total"]);
    }

    proptest! {
        #[test]
        fn prop_resolve_ignores_insertion_order(
            pairs in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,6}", 1..8),
            seed in any::<u64>(),
        ) {
            let index = LabelIndex::new(1_000);
            let forward: Vec<(String, String)> = pairs.clone().into_iter().collect();
            let mut shuffled = forward.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            shuffled.reverse();

            let a = index.resolve(&LabelSet::from_pairs(forward).unwrap()).unwrap();
            let b = index.resolve(&LabelSet::from_pairs(shuffled).unwrap()).unwrap();
            prop_assert_eq!(a, b);
            prop_assert_eq!(index.len(), 1);
        }
    }
}
