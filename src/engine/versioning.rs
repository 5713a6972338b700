//! Validity intervals and point-in-time reads
//!
//! Every versioned entity keeps an append-only list of intervals
//! `[valid_from, valid_to)`. The current state is the trailing open interval;
//! `as_of(ts)` selects the interval containing `ts`. Updates close the open
//! interval and append a new one, they never rewrite a closed interval.
//!
//! Timestamps are taken while the per-key entry lock is held, so intervals of
//! one key are ordered exactly like the mutations that produced them.

use std::hash::Hash;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::clock::{Clock, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval<T> {
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
    pub value: T,
}

impl<T> Interval<T> {
    #[inline]
    pub fn contains(&self, ts: Timestamp) -> bool {
        self.valid_from <= ts && self.valid_to.map_or(true, |to| ts < to)
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History<T> {
    intervals: Vec<Interval<T>>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }
}

impl<T: Clone + PartialEq> History<T> {
    pub fn from_intervals(mut intervals: Vec<Interval<T>>) -> Self {
        intervals.sort_by_key(|i| i.valid_from);
        Self { intervals }
    }

    /// Opens a new interval at `at`, closing the current one. Recording the
    /// value that is already current is a no-op and returns `false`.
    pub fn record(&mut self, at: Timestamp, value: T) -> bool {
        if self.current() == Some(&value) {
            return false;
        }
        let at = match self.intervals.last() {
            Some(last) => at.max(last.valid_from + 1),
            None => at,
        };
        self.close(at);
        self.intervals.push(Interval {
            valid_from: at,
            valid_to: None,
            value,
        });
        true
    }

    /// Ends the current interval at `at`. Returns whether one was open.
    pub fn close(&mut self, at: Timestamp) -> bool {
        match self.intervals.last_mut() {
            Some(last) if last.is_open() => {
                last.valid_to = Some(at.max(last.valid_from + 1));
                true
            }
            _ => false,
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.intervals
            .last()
            .filter(|i| i.is_open())
            .map(|i| &i.value)
    }

    pub fn current_interval(&self) -> Option<&Interval<T>> {
        self.intervals.last().filter(|i| i.is_open())
    }

    pub fn interval_as_of(&self, ts: Timestamp) -> Option<&Interval<T>> {
        let idx = self.intervals.partition_point(|i| i.valid_from <= ts);
        if idx == 0 {
            return None;
        }
        let candidate = &self.intervals[idx - 1];
        candidate.contains(ts).then_some(candidate)
    }

    pub fn as_of(&self, ts: Timestamp) -> Option<&T> {
        self.interval_as_of(ts).map(|i| &i.value)
    }

    /// Drops closed intervals that ended at or before `horizon`.
    pub fn purge_before(&mut self, horizon: Timestamp) -> usize {
        let before = self.intervals.len();
        self.intervals
            .retain(|i| i.valid_to.map_or(true, |to| to > horizon));
        before - self.intervals.len()
    }

    pub fn intervals(&self) -> &[Interval<T>] {
        &self.intervals
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// A concurrent map of per-key histories.
pub struct VersionedOverlay<K, T>
where
    K: Eq + Hash,
{
    entries: DashMap<K, History<T>>,
}

impl<K, T> Default for VersionedOverlay<K, T>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<K, T> VersionedOverlay<K, T>
where
    K: Eq + Hash + Copy + Ord,
    T: Clone + PartialEq,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` with the key's history locked and a fresh timestamp.
    pub fn update<R>(
        &self,
        key: K,
        clock: &dyn Clock,
        f: impl FnOnce(&mut History<T>, Timestamp) -> R,
    ) -> R {
        let mut history = self.entries.entry(key).or_default();
        let ts = clock.now();
        f(&mut *history, ts)
    }

    /// Records `value` as current. Returns the interval start, or `None` when
    /// the value was already current.
    pub fn record(&self, key: K, clock: &dyn Clock, value: T) -> Option<Timestamp> {
        self.update(key, clock, |h, ts| {
            h.record(ts, value)
                .then(|| h.current_interval().map(|i| i.valid_from))
                .flatten()
        })
    }

    /// Closes the current interval of `key`. Returns the closing timestamp.
    pub fn close(&self, key: K, clock: &dyn Clock) -> Option<Timestamp> {
        let mut history = self.entries.get_mut(&key)?;
        let ts = clock.now();
        history.close(ts).then_some(ts)
    }

    pub fn current(&self, key: &K) -> Option<T> {
        self.entries.get(key).and_then(|h| h.current().cloned())
    }

    pub fn current_interval(&self, key: &K) -> Option<Interval<T>> {
        self.entries
            .get(key)
            .and_then(|h| h.current_interval().cloned())
    }

    pub fn as_of(&self, key: &K, ts: Timestamp) -> Option<T> {
        self.entries.get(key).and_then(|h| h.as_of(ts).cloned())
    }

    pub fn history(&self, key: &K) -> Option<History<T>> {
        self.entries.get(key).map(|h| h.clone())
    }

    /// Installs a history wholesale, replacing any existing one.
    pub fn restore(&self, key: K, history: History<T>) {
        self.entries.insert(key, history);
    }

    /// Current values, ordered by key.
    pub fn current_all(&self) -> Vec<(K, T)> {
        let mut out: Vec<(K, T)> = self
            .entries
            .iter()
            .filter_map(|e| e.value().current().map(|v| (*e.key(), v.clone())))
            .collect();
        out.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Values as of `ts` with their intervals, ordered by key.
    pub fn all_as_of(&self, ts: Timestamp) -> Vec<(K, Interval<T>)> {
        let mut out: Vec<(K, Interval<T>)> = self
            .entries
            .iter()
            .filter_map(|e| e.value().interval_as_of(ts).map(|i| (*e.key(), i.clone())))
            .collect();
        out.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn current_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value().current().is_some())
            .count()
    }

    /// Purges closed intervals ending at or before `horizon`; keys left with
    /// no intervals are removed. Returns the number of intervals dropped.
    pub fn purge_before(&self, horizon: Timestamp) -> usize {
        let mut dropped = 0usize;
        self.entries.retain(|_, h| {
            dropped += h.purge_before(horizon);
            !h.is_empty()
        });
        dropped
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
