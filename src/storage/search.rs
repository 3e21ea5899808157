//! Filter / sort / paginate pipeline and its bounded result cache.

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::storage::index::Seq;
use crate::storage::record::{LogLevel, LogRecord};

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Field used to order search results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Timestamp,
    Level,
    Service,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Search filters plus sort and page selection.
///
/// Filters are applied in declaration order; unset filters match everything.
/// The free-text filter is a case-insensitive substring match over the
/// message and the serialized `data` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchQuery {
    pub level: Option<LogLevel>,
    pub service: Option<String>,
    pub user_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub search: Option<String>,
    pub request_id: Option<String>,
    pub status_code: Option<u16>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub page: usize,
    pub page_size: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            level: None,
            service: None,
            user_id: None,
            start_time: None,
            end_time: None,
            search: None,
            request_id: None,
            status_code: None,
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl SearchQuery {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self.end_time = Some(end);
        self
    }

    pub fn text(mut self, needle: impl Into<String>) -> Self {
        self.search = Some(needle.into());
        self
    }

    pub fn status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn sorted(mut self, by: SortBy, order: SortOrder) -> Self {
        self.sort_by = by;
        self.sort_order = order;
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Cache key: the exact serialized query.
    pub fn signature(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        if let Some(level) = self.level {
            if record.level != level {
                return false;
            }
        }
        if let Some(service) = &self.service {
            if record.service.as_deref() != Some(service.as_str()) {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if record.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.timestamp > end {
                return false;
            }
        }
        if let Some(needle) = self.search.as_deref().filter(|n| !n.is_empty()) {
            if !text_matches(record, needle) {
                return false;
            }
        }
        if let Some(request_id) = &self.request_id {
            if record.request_id.as_deref() != Some(request_id.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status_code {
            if record.metadata.status_code != Some(status) {
                return false;
            }
        }
        true
    }

    /// Order matched records in place. Ties fall back to arena order so the
    /// result is deterministic.
    pub fn sort(&self, hits: &mut [(Seq, &LogRecord)]) {
        hits.sort_by(|(sa, a), (sb, b)| {
            let primary = match self.sort_by {
                SortBy::Timestamp => a.timestamp.cmp(&b.timestamp),
                SortBy::Level => a.level.cmp(&b.level),
                SortBy::Service => a.service.cmp(&b.service),
            };
            let ord = primary.then(sa.cmp(sb));
            match self.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }

    /// Slice one page out of sorted hits.
    pub fn paginate(&self, hits: &[(Seq, &LogRecord)]) -> SearchResult {
        let page_size = if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        };
        let page = self.page.max(1);
        let total = hits.len();
        let pages = total.div_ceil(page_size);
        let logs = hits
            .iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .map(|(_, rec)| (*rec).clone())
            .collect();

        SearchResult {
            total,
            page,
            page_size,
            pages,
            logs,
        }
    }
}

fn text_matches(record: &LogRecord, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    if record.message.to_lowercase().contains(&needle) {
        return true;
    }
    serde_json::to_string(&record.data)
        .map(|data| data.to_lowercase().contains(&needle))
        .unwrap_or(false)
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub pages: usize,
    pub logs: Vec<LogRecord>,
}

// ---------------------------------------------------------------------------
// SearchCache
// ---------------------------------------------------------------------------

/// Bounded query-signature → result cache.
///
/// Lookups use `peek`, so a hit never refreshes an entry and eviction is by
/// insertion age rather than recency of use.
#[derive(Debug)]
pub(crate) struct SearchCache {
    entries: LruCache<String, SearchResult>,
    hits: u64,
    misses: u64,
}

impl SearchCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub(crate) fn get(&mut self, key: &str) -> Option<SearchResult> {
        match self.entries.peek(key) {
            Some(result) => {
                self.hits += 1;
                Some(result.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub(crate) fn insert(&mut self, key: String, result: SearchResult) {
        self.entries.push(key, result);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// (hits, misses) since creation.
    pub(crate) fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::LogInput;
    use chrono::Duration;

    fn rec(input: LogInput) -> LogRecord {
        LogRecord::from_input(input, Utc::now())
    }

    fn empty_result(total: usize) -> SearchResult {
        SearchResult {
            total,
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            pages: 0,
            logs: Vec::new(),
        }
    }

    #[test]
    fn test_text_filter_covers_message_and_data() {
        let in_message = rec(LogInput::new(LogLevel::Info, "Payment Declined"));
        let in_data = rec(
            LogInput::new(LogLevel::Info, "checkout")
                .with_data(serde_json::json!({"reason": "card declined"})),
        );
        let neither = rec(LogInput::new(LogLevel::Info, "ok"));

        let q = SearchQuery::default().text("declined");
        assert!(q.matches(&in_message));
        assert!(q.matches(&in_data));
        assert!(!q.matches(&neither));
    }

    #[test]
    fn test_time_range_is_inclusive() {
        let now = Utc::now();
        let r = rec(LogInput::new(LogLevel::Info, "edge").with_timestamp(now));
        assert!(SearchQuery::default().between(now, now).matches(&r));
        assert!(!SearchQuery::default()
            .between(now + Duration::seconds(1), now + Duration::seconds(2))
            .matches(&r));
    }

    #[test]
    fn test_missing_optional_field_fails_its_filter() {
        let r = rec(LogInput::new(LogLevel::Error, "no service"));
        assert!(!SearchQuery::default().service("auth").matches(&r));
        assert!(!SearchQuery::default().status(500).matches(&r));
        assert!(SearchQuery::default().level(LogLevel::Error).matches(&r));
    }

    #[test]
    fn test_default_sort_is_newest_first_and_paginates() {
        let now = Utc::now();
        let records: Vec<LogRecord> = (0..5)
            .map(|i| {
                rec(LogInput::new(LogLevel::Info, format!("m{i}"))
                    .with_timestamp(now + Duration::seconds(i)))
            })
            .collect();
        let mut hits: Vec<(Seq, &LogRecord)> =
            records.iter().enumerate().map(|(i, r)| (i as Seq, r)).collect();

        let q = SearchQuery::default().page(2, 2);
        q.sort(&mut hits);
        let page = q.paginate(&hits);

        assert_eq!(page.total, 5);
        assert_eq!(page.pages, 3);
        assert_eq!(page.page, 2);
        let messages: Vec<&str> = page.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["m2", "m1"]);
    }

    #[test]
    fn test_page_past_end_is_empty() {
        let r = rec(LogInput::new(LogLevel::Info, "only"));
        let hits = vec![(0, &r)];
        let page = SearchQuery::default().page(9, 10).paginate(&hits);
        assert_eq!(page.total, 1);
        assert_eq!(page.pages, 1);
        assert!(page.logs.is_empty());
    }

    #[test]
    fn test_cache_evicts_oldest_when_full() {
        let mut cache = SearchCache::new(2);
        cache.insert("a".into(), empty_result(1));
        cache.insert("b".into(), empty_result(2));
        cache.insert("c".into(), empty_result(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").map(|r| r.total), Some(3));
        assert_eq!(cache.counters(), (1, 1));
    }

    #[test]
    fn test_cache_hit_does_not_delay_eviction() {
        let mut cache = SearchCache::new(2);
        cache.insert("a".into(), empty_result(1));
        cache.insert("b".into(), empty_result(2));
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), empty_result(3));

        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_zero_capacity_cache_holds_one_entry() {
        let mut cache = SearchCache::new(0);
        cache.insert("a".into(), empty_result(1));
        cache.insert("b".into(), empty_result(2));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn test_signature_distinguishes_queries() {
        let a = SearchQuery::default().level(LogLevel::Error).signature();
        let b = SearchQuery::default().level(LogLevel::Warn).signature();
        assert!(a.is_some());
        assert_ne!(a, b);
        assert_eq!(a, SearchQuery::default().level(LogLevel::Error).signature());
    }
}
