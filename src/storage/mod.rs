//! In-memory record store -- arena, secondary indexes, search and export.
//!
//! Records live in an arena keyed by a monotonically increasing sequence
//! number, so arena order is ingest order and the oldest record is always the
//! first key. Indexes hold only sequence numbers. The arena and all indexes
//! share one `RwLock`; every mutation clears the search cache while still
//! holding the write lock, so a search can never observe a completed write
//! through a stale cache entry.

pub mod export;
pub mod index;
pub mod record;
pub mod search;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use self::index::{IndexSet, Seq};
use self::record::{time_bucket, LogInput, LogLevel, LogRecord};
use self::search::{SearchCache, SearchQuery, SearchResult};

/// Records removed per write-lock acquisition during a retention sweep.
const SWEEP_BATCH: usize = 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("retention window of {days} days is out of range")]
    InvalidRetention { days: u32 },
}

/// Aggregate view of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_logs: usize,
    pub by_level: BTreeMap<String, usize>,
    pub by_service: BTreeMap<String, usize>,
    /// Fraction of stored records at `error` or `fatal`.
    pub error_rate: f64,
    /// Mean `metadata.duration` over records that carry one.
    pub avg_response_time: f64,
    pub total_ingested: u64,
    pub total_evicted: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Outcome of one retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    pub evicted: usize,
    pub remaining: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<Seq, LogRecord>,
    by_id: HashMap<Uuid, Seq>,
    indexes: IndexSet,
    next_seq: Seq,
    duration_sum: f64,
    duration_count: usize,
    total_ingested: u64,
    total_evicted: u64,
}

impl StoreInner {
    fn insert(&mut self, record: LogRecord) -> Seq {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.indexes.insert(seq, &record);
        self.by_id.insert(record.id, seq);
        if let Some(d) = record.metadata.duration {
            self.duration_sum += d;
            self.duration_count += 1;
        }
        self.records.insert(seq, record);
        self.total_ingested += 1;
        seq
    }

    /// Remove one record from the arena and every index it appears in.
    fn remove(&mut self, seq: Seq) -> Option<LogRecord> {
        let record = self.records.remove(&seq)?;
        self.indexes.remove(seq, &record);
        self.by_id.remove(&record.id);
        if let Some(d) = record.metadata.duration {
            self.duration_sum -= d;
            self.duration_count -= 1;
        }
        self.total_evicted += 1;
        Some(record)
    }

    fn oldest(&self) -> Option<Seq> {
        self.records.keys().next().copied()
    }

    fn resolve<'a>(
        &'a self,
        seqs: impl Iterator<Item = Seq> + 'a,
    ) -> impl Iterator<Item = (Seq, &'a LogRecord)> + 'a {
        seqs.filter_map(move |seq| self.records.get(&seq).map(|rec| (seq, rec)))
    }

    fn lookup(&self, seqs: Option<&BTreeSet<Seq>>) -> Vec<LogRecord> {
        match seqs {
            Some(set) => self
                .resolve(set.iter().copied())
                .map(|(_, rec)| rec.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All records matching `query`, sorted but not paginated.
    fn matching(&self, query: &SearchQuery) -> Vec<(Seq, &LogRecord)> {
        let mut keyed: Vec<Option<&BTreeSet<Seq>>> = Vec::new();
        if let Some(level) = query.level {
            keyed.push(self.indexes.level(level));
        }
        if let Some(service) = &query.service {
            keyed.push(self.indexes.service(service));
        }
        if let Some(user) = &query.user_id {
            keyed.push(self.indexes.user(user));
        }
        // A filter on a key absent from its index can match nothing.
        if keyed.iter().any(Option::is_none) {
            return Vec::new();
        }
        let candidates = keyed.into_iter().flatten().min_by_key(|set| set.len());

        let mut hits: Vec<(Seq, &LogRecord)> = match candidates {
            Some(set) => self
                .resolve(set.iter().copied())
                .filter(|(_, rec)| query.matches(rec))
                .collect(),
            None if query.start_time.is_some() || query.end_time.is_some() => {
                let lower = query
                    .start_time
                    .map_or(Bound::Unbounded, |t| Bound::Included(time_bucket(&t)));
                let upper = query
                    .end_time
                    .map_or(Bound::Unbounded, |t| Bound::Included(time_bucket(&t)));
                if matches!((lower, upper), (Bound::Included(l), Bound::Included(u)) if l > u) {
                    return Vec::new();
                }
                self.resolve(self.indexes.buckets((lower, upper)))
                    .filter(|(_, rec)| query.matches(rec))
                    .collect()
            }
            None => self
                .records
                .iter()
                .map(|(seq, rec)| (*seq, rec))
                .filter(|(_, rec)| query.matches(rec))
                .collect(),
        };
        query.sort(&mut hits);
        hits
    }
}

/// Bounded, multiply-indexed in-memory log store.
#[derive(Debug)]
pub struct LogStore {
    inner: RwLock<StoreInner>,
    cache: Mutex<SearchCache>,
    config: StoreConfig,
}

impl LogStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            cache: Mutex::new(SearchCache::new(config.search_cache_size)),
            config,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Enrich and store a record, evicting the oldest records beyond
    /// `max_logs`. Invalidates the search cache.
    pub fn add(&self, input: LogInput) -> LogRecord {
        let record = LogRecord::from_input(input, Utc::now());
        let stored = record.clone();

        let mut inner = self.inner.write();
        inner.insert(record);
        while inner.records.len() > self.config.max_logs {
            match inner.oldest() {
                Some(oldest) => {
                    if let Some(evicted) = inner.remove(oldest) {
                        debug!(id = %evicted.id, "evicted oldest record at capacity");
                    }
                }
                None => break,
            }
        }
        self.cache.lock().clear();
        stored
    }

    pub fn get(&self, id: &Uuid) -> Option<LogRecord> {
        let inner = self.inner.read();
        inner
            .by_id
            .get(id)
            .and_then(|seq| inner.records.get(seq))
            .cloned()
    }

    pub fn by_level(&self, level: LogLevel) -> Vec<LogRecord> {
        let inner = self.inner.read();
        inner.lookup(inner.indexes.level(level))
    }

    pub fn by_service(&self, service: &str) -> Vec<LogRecord> {
        let inner = self.inner.read();
        inner.lookup(inner.indexes.service(service))
    }

    pub fn by_user(&self, user_id: &str) -> Vec<LogRecord> {
        let inner = self.inner.read();
        inner.lookup(inner.indexes.user(user_id))
    }

    /// Filtered, sorted, paginated search. Results are cached per exact
    /// query until the next write.
    pub fn search(&self, query: &SearchQuery) -> SearchResult {
        let inner = self.inner.read();
        let key = query.signature();
        if let Some(key) = &key {
            if let Some(hit) = self.cache.lock().get(key) {
                return hit;
            }
        }

        let result = query.paginate(&inner.matching(query));
        if let Some(key) = key {
            self.cache.lock().insert(key, result.clone());
        }
        result
    }

    /// Every record matching `query`, in query sort order, ignoring paging.
    pub fn matching(&self, query: &SearchQuery) -> Vec<LogRecord> {
        let inner = self.inner.read();
        inner
            .matching(query)
            .into_iter()
            .map(|(_, rec)| rec.clone())
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        let total = inner.records.len();
        let by_level: BTreeMap<String, usize> = inner
            .indexes
            .level_counts()
            .map(|(level, n)| (level.to_string(), n))
            .collect();
        let errors: usize = inner
            .indexes
            .level_counts()
            .filter(|(level, _)| level.is_error())
            .map(|(_, n)| n)
            .sum();
        let by_service = inner
            .indexes
            .service_counts()
            .map(|(service, n)| (service.to_string(), n))
            .collect();
        let (cache_hits, cache_misses) = self.cache.lock().counters();

        StoreStats {
            total_logs: total,
            by_level,
            by_service,
            error_rate: if total == 0 {
                0.0
            } else {
                errors as f64 / total as f64
            },
            avg_response_time: if inner.duration_count == 0 {
                0.0
            } else {
                inner.duration_sum / inner.duration_count as f64
            },
            total_ingested: inner.total_ingested,
            total_evicted: inner.total_evicted,
            cache_hits,
            cache_misses,
        }
    }

    /// Remove every record older than `now - retention_days`.
    ///
    /// Expired records are located through the time index under a read lock,
    /// then removed in batches, each under its own write lock, so ingest is
    /// never blocked for the whole sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let days = self.config.retention_days;
        let cutoff = now
            .checked_sub_signed(Duration::days(i64::from(days)))
            .ok_or(StoreError::InvalidRetention { days })?;

        let expired: Vec<Seq> = {
            let inner = self.inner.read();
            let upper = Bound::Included(time_bucket(&cutoff));
            inner
                .resolve(inner.indexes.buckets((Bound::Unbounded, upper)))
                .filter(|(_, rec)| rec.timestamp < cutoff)
                .map(|(seq, _)| seq)
                .collect()
        };

        let mut evicted = 0;
        for batch in expired.chunks(SWEEP_BATCH) {
            let mut inner = self.inner.write();
            for seq in batch {
                // May already be gone through the hard cap.
                if inner.remove(*seq).is_some() {
                    evicted += 1;
                }
            }
            self.cache.lock().clear();
        }

        let remaining = self.len();
        if evicted > 0 {
            info!(evicted, remaining, cutoff = %cutoff, "retention sweep removed expired records");
        } else {
            debug!(remaining, cutoff = %cutoff, "retention sweep found nothing to remove");
        }
        Ok(SweepReport {
            cutoff,
            evicted,
            remaining,
        })
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let dropped = inner.records.len() as u64;
        inner.records.clear();
        inner.by_id.clear();
        inner.indexes.clear();
        inner.duration_sum = 0.0;
        inner.duration_count = 0;
        inner.total_evicted += dropped;
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    pub fn cached_queries(&self) -> usize {
        self.cache.lock().len()
    }

    /// Verify arena/index symmetry; test helper.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.read();
        for (seq, rec) in &inner.records {
            let expected = 2 + usize::from(rec.service.is_some()) + usize::from(rec.user_id.is_some());
            assert_eq!(inner.indexes.entries_for(*seq), expected, "index entries for {}", rec.id);
        }
        for seq in inner.indexes.all_referenced() {
            assert!(inner.records.contains_key(&seq), "dangling index entry {seq}");
        }
        assert_eq!(inner.by_id.len(), inner.records.len());
    }
}
