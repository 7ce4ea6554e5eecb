//! Read-side queries over namespace buckets.
//!
//! Every query walks a bucket cursor. Primary buckets are keyed by big-endian
//! id, so ascending cursor order is id order; `<kind>__sorted` buckets are
//! keyed so that descending order is newest first. A missing bucket reads as
//! empty.

use crate::codec::Record;
use crate::error::{ContentError, ContentResult};
use crate::storage::{key_id, Backend, Namespace};
use regex::bytes::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Cursor direction. Anything other than `asc` reads as [`Order::Desc`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl Order {
    pub fn as_str(&self) -> &'static str {
        match self {
            Order::Asc => "asc",
            Order::Desc => "desc",
        }
    }
}

impl FromStr for Order {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Order::from(s))
    }
}

impl From<&str> for Order {
    fn from(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("asc") {
            Order::Asc
        } else {
            Order::Desc
        }
    }
}

impl From<String> for Order {
    fn from(s: String) -> Self {
        Order::from(s.as_str())
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paging parameters. `count == -1` selects every entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    pub count: i64,
    pub offset: i64,
    pub order: Order,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            count: 10,
            offset: 0,
            order: Order::Desc,
        }
    }
}

impl QueryOptions {
    pub fn all(order: Order) -> Self {
        Self {
            count: -1,
            offset: 0,
            order,
        }
    }

    /// `[start, end)` of the page over `total` entries.
    pub fn window(&self, total: usize) -> (usize, usize) {
        let total = total as i64;
        let (start, end) = match self.count {
            c if c < 0 => (0, total),
            0 => (0, 0),
            c => {
                let start = c.saturating_mul(self.offset.max(0)).min(total);
                (start, start.saturating_add(c).min(total))
            }
        };
        (start as usize, end as usize)
    }
}

/// One page of raw records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Page {
    /// Entries in the bucket
    pub total: usize,

    /// Entries that satisfied the filter (equal to `total` when unfiltered)
    pub matched: usize,

    pub records: Vec<Vec<u8>>,
}

/// How [`QueryEngine::filter_by_field_value`] compares values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterMode {
    /// Literal `"field":"value"` match against the serialized bytes. Misses
    /// numbers and escaped strings, and can hit nested objects.
    Legacy,
    /// Decodes each record and compares the top-level field.
    #[default]
    Structural,
}

/// Read-only query API.
#[derive(Clone)]
pub struct QueryEngine {
    backend: Arc<Backend>,
}

impl QueryEngine {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    /// Returns the `opts` page of `namespace` and the bucket size.
    pub fn paginate(&self, namespace: &str, opts: &QueryOptions) -> ContentResult<Page> {
        let ns = parse_namespace(namespace)?;
        let Some(tree) = self.backend.bucket(&ns.bucket())? else {
            return Ok(Page::default());
        };

        let total = tree.len();
        let (start, end) = opts.window(total);
        let mut records = Vec::with_capacity(end - start);
        for value in cursor(&tree, opts.order).skip(start).take(end - start) {
            records.push(value?.to_vec());
        }

        debug!(namespace = %ns, total, start, end, order = %opts.order, "Paginated bucket");
        Ok(Page {
            total,
            matched: total,
            records,
        })
    }

    /// Like [`QueryEngine::paginate`] but only over records whose `field`
    /// equals `value`.
    pub fn filter_by_field_value(
        &self,
        namespace: &str,
        field: &str,
        value: &str,
        opts: &QueryOptions,
        mode: FilterMode,
    ) -> ContentResult<Page> {
        let ns = parse_namespace(namespace)?;
        let Some(tree) = self.backend.bucket(&ns.bucket())? else {
            return Ok(Page::default());
        };

        let needle = match mode {
            FilterMode::Legacy => Some(literal(&format!("\"{}\":\"{}\"", field, value), false)?),
            FilterMode::Structural => None,
        };

        let mut matches = Vec::new();
        for raw in cursor(&tree, opts.order) {
            let raw = raw?;
            let hit = match &needle {
                Some(needle) => needle.is_match(&raw),
                None => match Record::from_bytes(&raw) {
                    Ok(record) => field_equals(&record, field, value),
                    Err(e) => {
                        warn!(namespace = %ns, "Skipping undecodable record in filter: {}", e);
                        false
                    }
                },
            };
            if hit {
                matches.push(raw.to_vec());
            }
        }

        let matched = matches.len();
        let (start, end) = opts.window(matched);
        let records = matches.drain(start..end).collect();
        Ok(Page {
            total: tree.len(),
            matched,
            records,
        })
    }

    /// Records whose serialized form contains `query`, ignoring case.
    /// With `include_matches == false` the non-matching records are returned.
    pub fn substring_search(
        &self,
        namespace: &str,
        query: &str,
        include_matches: bool,
    ) -> ContentResult<Vec<Vec<u8>>> {
        let matcher = literal(query, true)?;
        self.scan(namespace, |raw| matcher.is_match(raw) == include_matches)
    }

    /// Records whose serialized form matches `pattern`, ignoring case.
    pub fn regex_search(
        &self,
        namespace: &str,
        pattern: &str,
        include_matches: bool,
    ) -> ContentResult<Vec<Vec<u8>>> {
        let matcher = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ContentError::InvalidArgument(format!("bad pattern {:?}: {}", pattern, e)))?;
        self.scan(namespace, |raw| matcher.is_match(raw) == include_matches)
    }

    /// Records whose `updated` lies strictly between `start` and `end`
    /// (milliseconds). A zero bound leaves that side open.
    pub fn time_range(&self, namespace: &str, start: i64, end: i64) -> ContentResult<Vec<Vec<u8>>> {
        let ns = parse_namespace(namespace)?;
        self.scan(namespace, |raw| match Record::from_bytes(raw) {
            Ok(record) => {
                let updated = record.updated();
                (start == 0 || updated > start) && (end == 0 || updated < end)
            }
            Err(e) => {
                warn!(namespace = %ns, "Skipping undecodable record in time range: {}", e);
                false
            }
        })
    }

    /// Decimal ids present in `namespace`. With `sorted` the ids come from the
    /// sorted index, newest first; otherwise from the bucket in id order.
    pub fn keys(&self, namespace: &str, sorted: bool) -> ContentResult<Vec<String>> {
        let ns = parse_namespace(namespace)?;
        let mut ids = Vec::new();

        if sorted {
            let Some(tree) = self.backend.bucket(&ns.sorted_bucket())? else {
                return Ok(ids);
            };
            for raw in tree.iter().values().rev() {
                match Record::from_bytes(&raw?) {
                    Ok(record) => ids.push(record.id().to_string()),
                    Err(e) => warn!(namespace = %ns, "Skipping undecodable sorted entry: {}", e),
                }
            }
        } else {
            let Some(tree) = self.backend.bucket(&ns.bucket())? else {
                return Ok(ids);
            };
            for key in tree.iter().keys() {
                if let Some(id) = key_id(&key?) {
                    ids.push(id.to_string());
                }
            }
        }
        Ok(ids)
    }

    /// `value_field` of the newest record whose `match_field` equals
    /// `match_value`.
    pub fn lookup_value(
        &self,
        namespace: &str,
        match_field: &str,
        match_value: &str,
        value_field: &str,
    ) -> ContentResult<String> {
        let ns = parse_namespace(namespace)?;
        let not_found = || {
            ContentError::NotFound(format!("{} where {} = {}", ns, match_field, match_value))
        };
        let Some(tree) = self.backend.bucket(&ns.bucket())? else {
            return Err(not_found());
        };

        for raw in cursor(&tree, Order::Desc) {
            let record = match Record::from_bytes(&raw?) {
                Ok(record) => record,
                Err(e) => {
                    warn!(namespace = %ns, "Skipping undecodable record in lookup: {}", e);
                    continue;
                }
            };
            if field_equals(&record, match_field, match_value) {
                return record
                    .get(value_field)
                    .and_then(scalar_string)
                    .ok_or_else(|| ContentError::NotFound(format!("{}.{}", ns, value_field)));
            }
        }
        Err(not_found())
    }

    fn scan<F>(&self, namespace: &str, mut keep: F) -> ContentResult<Vec<Vec<u8>>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let ns = parse_namespace(namespace)?;
        let Some(tree) = self.backend.bucket(&ns.bucket())? else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for raw in tree.iter().values() {
            let raw = raw?;
            if keep(&raw) {
                records.push(raw.to_vec());
            }
        }
        Ok(records)
    }
}

fn cursor(tree: &sled::Tree, order: Order) -> Box<dyn Iterator<Item = sled::Result<sled::IVec>>> {
    match order {
        Order::Asc => Box::new(tree.iter().values()),
        Order::Desc => Box::new(tree.iter().values().rev()),
    }
}

fn literal(text: &str, case_insensitive: bool) -> ContentResult<Regex> {
    RegexBuilder::new(&regex::escape(text))
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| ContentError::InvalidArgument(e.to_string()))
}

/// Top-level field equality on string forms. Arrays match on any element.
fn field_equals(record: &Record, field: &str, value: &str) -> bool {
    match record.get(field) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar_string).any(|s| s == value),
        Some(other) => scalar_string(other).map_or(false, |s| s == value),
        None => false,
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn parse_namespace(raw: &str) -> ContentResult<Namespace> {
    Namespace::parse(raw).map_err(ContentError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{id_key, BackendConfig};
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Backend>, QueryEngine) {
        let temp_dir = TempDir::new().unwrap();
        let backend = Backend::new(BackendConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();
        let query = QueryEngine::new(backend.clone());
        (temp_dir, backend, query)
    }

    fn put(backend: &Backend, bucket: &str, id: u64, value: serde_json::Value) {
        let tree = backend.bucket_or_create(bucket).unwrap();
        tree.insert(&id_key(id)[..], value.to_string().into_bytes()).unwrap();
    }

    fn ids(records: &[Vec<u8>]) -> Vec<i64> {
        records
            .iter()
            .map(|raw| Record::from_bytes(raw).unwrap().id())
            .collect()
    }

    fn opts(count: i64, offset: i64, order: Order) -> QueryOptions {
        QueryOptions { count, offset, order }
    }

    #[test]
    fn test_order_parses_leniently() {
        assert_eq!("asc".parse::<Order>().unwrap(), Order::Asc);
        assert_eq!(Order::from("ASC"), Order::Asc);
        assert_eq!(Order::from(""), Order::Desc);
        assert_eq!(Order::from("sideways"), Order::Desc);

        let parsed: QueryOptions = serde_json::from_str(r#"{"order":"bogus","count":5}"#).unwrap();
        assert_eq!(parsed, opts(5, 0, Order::Desc));
    }

    #[test]
    fn test_window_bounds() {
        assert_eq!(opts(10, 0, Order::Desc).window(3), (0, 3));
        assert_eq!(opts(10, 5, Order::Desc).window(3), (3, 3));
        assert_eq!(opts(2, 1, Order::Desc).window(5), (2, 4));
        assert_eq!(opts(-1, 7, Order::Desc).window(5), (0, 5));
        assert_eq!(opts(0, 0, Order::Desc).window(5), (0, 0));
        assert_eq!(opts(i64::MAX, i64::MAX, Order::Desc).window(5), (5, 5));
    }

    #[test]
    fn test_paginate_orders_and_clamps() {
        let (_dir, backend, query) = setup();
        for id in 1..=3 {
            put(&backend, "Post", id, json!({"id": id}));
        }

        let page = query.paginate("Post", &opts(10, 0, Order::Desc)).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(ids(&page.records), vec![3, 2, 1]);

        let page = query.paginate("Post", &opts(2, 0, Order::Asc)).unwrap();
        assert_eq!(ids(&page.records), vec![1, 2]);

        let page = query.paginate("Post", &opts(10, 5, Order::Desc)).unwrap();
        assert_eq!(page.total, 3);
        assert!(page.records.is_empty());

        let page = query.paginate("Missing", &QueryOptions::default()).unwrap();
        assert_eq!(page, Page::default());
    }

    #[test]
    fn test_filter_modes() {
        let (_dir, backend, query) = setup();
        put(&backend, "Post", 1, json!({"id": 1, "category": "news"}));
        put(&backend, "Post", 2, json!({"id": 2, "category": "sports"}));
        put(&backend, "Post", 3, json!({"id": 3, "category": "news", "rank": 7}));
        put(&backend, "Post", 4, json!({"id": 4, "rank": "7"}));

        let all = QueryOptions::all(Order::Asc);
        let page = query
            .filter_by_field_value("Post", "category", "news", &all, FilterMode::Legacy)
            .unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.matched, 2);
        assert_eq!(ids(&page.records), vec![1, 3]);

        // Numbers only match structurally
        let legacy = query
            .filter_by_field_value("Post", "rank", "7", &all, FilterMode::Legacy)
            .unwrap();
        assert_eq!(ids(&legacy.records), vec![4]);
        let structural = query
            .filter_by_field_value("Post", "rank", "7", &all, FilterMode::Structural)
            .unwrap();
        assert_eq!(ids(&structural.records), vec![3, 4]);

        let paged = query
            .filter_by_field_value("Post", "category", "news", &opts(1, 1, Order::Desc), FilterMode::Structural)
            .unwrap();
        assert_eq!(paged.matched, 2);
        assert_eq!(ids(&paged.records), vec![1]);
    }

    #[test]
    fn test_substring_and_regex_search() {
        let (_dir, backend, query) = setup();
        put(&backend, "Post", 1, json!({"id": 1, "title": "Hello World"}));
        put(&backend, "Post", 2, json!({"id": 2, "title": "Goodbye"}));

        assert_eq!(ids(&query.substring_search("Post", "hello", true).unwrap()), vec![1]);
        assert_eq!(ids(&query.substring_search("Post", "hello", false).unwrap()), vec![2]);
        assert_eq!(ids(&query.substring_search("Post", "(", true).unwrap()), Vec::<i64>::new());

        assert_eq!(ids(&query.regex_search("Post", "good.+e", true).unwrap()), vec![2]);
        assert!(matches!(
            query.regex_search("Post", "(", true),
            Err(ContentError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_time_range_open_interval() {
        let (_dir, backend, query) = setup();
        put(&backend, "Post", 1, json!({"id": 1, "updated": 100}));
        put(&backend, "Post", 2, json!({"id": 2, "updated": 200}));
        put(&backend, "Post", 3, json!({"id": 3, "updated": 300}));
        backend
            .bucket("Post")
            .unwrap()
            .unwrap()
            .insert(&id_key(4)[..], &b"garbage"[..])
            .unwrap();

        assert_eq!(ids(&query.time_range("Post", 100, 300).unwrap()), vec![2]);
        assert_eq!(ids(&query.time_range("Post", 150, 0).unwrap()), vec![2, 3]);
        assert_eq!(ids(&query.time_range("Post", 0, 250).unwrap()), vec![1, 2]);
        assert_eq!(ids(&query.time_range("Post", 0, 0).unwrap()), vec![1, 2, 3]);
    }

    #[test]
    fn test_keys_and_lookup() {
        let (_dir, backend, query) = setup();
        put(&backend, "Post", 2, json!({"id": 2, "author": "ann", "email": "old@x"}));
        put(&backend, "Post", 10, json!({"id": 10, "author": "ann", "email": "new@x"}));

        assert_eq!(query.keys("Post", false).unwrap(), vec!["2", "10"]);
        assert!(query.keys("Post", true).unwrap().is_empty());

        assert_eq!(query.lookup_value("Post", "author", "ann", "email").unwrap(), "new@x");
        assert!(matches!(
            query.lookup_value("Post", "author", "bob", "email"),
            Err(ContentError::NotFound(_))
        ));
    }
}
