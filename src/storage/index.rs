//! Secondary indexes over the record arena.
//!
//! Every index maps a key to the ordered set of arena sequence numbers that
//! carry it. Insert and remove are symmetric: a record is indexed by level
//! and minute bucket always, and by service and user only when set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use crate::storage::record::{LogLevel, LogRecord};

/// Arena key of a stored record. Monotonically increasing, never reused.
pub type Seq = u64;

#[derive(Debug, Default)]
pub struct IndexSet {
    by_level: HashMap<LogLevel, BTreeSet<Seq>>,
    by_service: HashMap<String, BTreeSet<Seq>>,
    by_bucket: BTreeMap<i64, BTreeSet<Seq>>,
    by_user: HashMap<String, BTreeSet<Seq>>,
}

impl IndexSet {
    pub fn insert(&mut self, seq: Seq, record: &LogRecord) {
        self.by_level.entry(record.level).or_default().insert(seq);
        self.by_bucket
            .entry(record.time_bucket())
            .or_default()
            .insert(seq);
        if let Some(service) = &record.service {
            self.by_service
                .entry(service.clone())
                .or_default()
                .insert(seq);
        }
        if let Some(user) = &record.user_id {
            self.by_user.entry(user.clone()).or_default().insert(seq);
        }
    }

    pub fn remove(&mut self, seq: Seq, record: &LogRecord) {
        remove_from(&mut self.by_level, &record.level, seq);
        let bucket = record.time_bucket();
        if let Some(set) = self.by_bucket.get_mut(&bucket) {
            set.remove(&seq);
            if set.is_empty() {
                self.by_bucket.remove(&bucket);
            }
        }
        if let Some(service) = &record.service {
            remove_from(&mut self.by_service, service, seq);
        }
        if let Some(user) = &record.user_id {
            remove_from(&mut self.by_user, user, seq);
        }
    }

    pub fn clear(&mut self) {
        self.by_level.clear();
        self.by_service.clear();
        self.by_bucket.clear();
        self.by_user.clear();
    }

    pub fn level(&self, level: LogLevel) -> Option<&BTreeSet<Seq>> {
        self.by_level.get(&level)
    }

    pub fn service(&self, service: &str) -> Option<&BTreeSet<Seq>> {
        self.by_service.get(service)
    }

    pub fn user(&self, user: &str) -> Option<&BTreeSet<Seq>> {
        self.by_user.get(user)
    }

    /// Sequence numbers whose minute bucket falls in `range`.
    pub fn buckets(&self, range: (Bound<i64>, Bound<i64>)) -> impl Iterator<Item = Seq> + '_ {
        self.by_bucket
            .range(range)
            .flat_map(|(_, set)| set.iter().copied())
    }

    /// Records per level, for levels with at least one record.
    pub fn level_counts(&self) -> impl Iterator<Item = (LogLevel, usize)> + '_ {
        self.by_level.iter().map(|(level, set)| (*level, set.len()))
    }

    pub fn service_counts(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.by_service
            .iter()
            .map(|(service, set)| (service.as_str(), set.len()))
    }

    /// Number of index entries referencing `seq`, across all four indexes.
    #[cfg(test)]
    pub fn entries_for(&self, seq: Seq) -> usize {
        fn count<'a>(sets: impl Iterator<Item = &'a BTreeSet<Seq>>, seq: Seq) -> usize {
            sets.filter(|s| s.contains(&seq)).count()
        }
        count(self.by_level.values(), seq)
            + count(self.by_service.values(), seq)
            + count(self.by_user.values(), seq)
            + count(self.by_bucket.values(), seq)
    }

    /// Every sequence number referenced by any index.
    #[cfg(test)]
    pub fn all_referenced(&self) -> BTreeSet<Seq> {
        self.by_level
            .values()
            .chain(self.by_service.values())
            .chain(self.by_user.values())
            .chain(self.by_bucket.values())
            .flat_map(|s| s.iter().copied())
            .collect()
    }
}

fn remove_from<K, Q>(map: &mut HashMap<K, BTreeSet<Seq>>, key: &Q, seq: Seq)
where
    K: std::borrow::Borrow<Q> + std::hash::Hash + Eq,
    Q: std::hash::Hash + Eq + ?Sized,
{
    if let Some(set) = map.get_mut(key) {
        set.remove(&seq);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::LogInput;
    use chrono::Utc;

    fn record(input: LogInput) -> LogRecord {
        LogRecord::from_input(input, Utc::now())
    }

    #[test]
    fn test_insert_counts_only_applicable_indexes() {
        let mut idx = IndexSet::default();
        let bare = record(LogInput::new(LogLevel::Info, "bare"));
        let full = record(
            LogInput::new(LogLevel::Error, "full")
                .with_service("auth")
                .with_user("u1"),
        );
        idx.insert(1, &bare);
        idx.insert(2, &full);

        assert_eq!(idx.entries_for(1), 2);
        assert_eq!(idx.entries_for(2), 4);
    }

    #[test]
    fn test_remove_is_symmetric_and_drops_empty_keys() {
        let mut idx = IndexSet::default();
        let rec = record(
            LogInput::new(LogLevel::Warn, "w")
                .with_service("billing")
                .with_user("u2"),
        );
        idx.insert(7, &rec);
        idx.remove(7, &rec);

        assert_eq!(idx.entries_for(7), 0);
        assert!(idx.level(LogLevel::Warn).is_none());
        assert!(idx.service("billing").is_none());
        assert!(idx.user("u2").is_none());
        assert!(idx.all_referenced().is_empty());
    }

    #[test]
    fn test_bucket_range_scan() {
        let mut idx = IndexSet::default();
        let now = Utc::now();
        let old = record(
            LogInput::new(LogLevel::Info, "old").with_timestamp(now - chrono::Duration::hours(2)),
        );
        let new = record(LogInput::new(LogLevel::Info, "new").with_timestamp(now));
        idx.insert(1, &old);
        idx.insert(2, &new);

        let before: Vec<Seq> = idx
            .buckets((Bound::Unbounded, Bound::Excluded(new.time_bucket())))
            .collect();
        assert_eq!(before, vec![1]);
        let all: Vec<Seq> = idx.buckets((Bound::Unbounded, Bound::Unbounded)).collect();
        assert_eq!(all.len(), 2);
    }
}
