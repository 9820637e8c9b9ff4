//! Filter / sort / search / paginate projections over a snapshot.
//!
//! The pipeline is fixed: full-text search, then categorical filters (AND),
//! then a stable sort, then the page slice. Projection is pure, so it can be
//! recomputed on every snapshot without caching.

use std::cmp::Ordering;
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{scalar_text, Entity, Snapshot};

// ---------------------------------------------------------------------------
// ViewState
// ---------------------------------------------------------------------------

/// Exact match of one categorical field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: String,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    fn matches(&self, entity: &Entity) -> bool {
        entity
            .field(&self.field)
            .and_then(scalar_text)
            .is_some_and(|v| v == self.value)
    }
}

impl FromStr for FieldFilter {
    type Err = anyhow::Error;

    /// Parses `field=value`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, value) = s
            .split_once('=')
            .with_context(|| format!("filter '{s}' must look like field=value"))?;
        if field.trim().is_empty() {
            bail!("filter '{s}' has an empty field name");
        }
        Ok(Self::new(field.trim(), value.trim()))
    }
}

/// Sort direction or categorical ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Ascending,
    /// Numeric descending for severity / impact style fields.
    Descending,
    /// Fixed categorical order, e.g. `critical, high, medium, low`.
    /// Values not listed sort after all listed ones.
    Ranked(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: SortOrder,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Descending,
        }
    }

    pub fn ranked<S: Into<String>>(field: impl Into<String>, ranks: impl IntoIterator<Item = S>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Ranked(ranks.into_iter().map(Into::into).collect()),
        }
    }

    fn compare(&self, a: &Entity, b: &Entity) -> Ordering {
        let (va, vb) = (a.field(&self.field), b.field(&self.field));
        match &self.order {
            SortOrder::Ascending => compare_present(va, vb, false),
            SortOrder::Descending => compare_present(va, vb, true),
            SortOrder::Ranked(ranks) => rank(va, ranks).cmp(&rank(vb, ranks)),
        }
    }
}

impl FromStr for SortSpec {
    type Err = anyhow::Error;

    /// Parses `field`, `field:asc`, `field:desc` or `field:rank=a,b,c`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, order) = match s.split_once(':') {
            Some((field, order)) => (field.trim(), order.trim()),
            None => (s.trim(), "asc"),
        };
        if field.is_empty() {
            bail!("sort '{s}' has an empty field name");
        }
        match order {
            "asc" => Ok(Self::ascending(field)),
            "desc" => Ok(Self::descending(field)),
            other => match other.strip_prefix("rank=") {
                Some(ranks) => Ok(Self::ranked(
                    field,
                    ranks.split(',').map(str::trim).filter(|r| !r.is_empty()),
                )),
                None => bail!("unknown sort order '{other}', expected asc, desc or rank=..."),
            },
        }
    }
}

/// UI-local view parameters. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewState {
    pub search: String,
    pub filters: Vec<FieldFilter>,
    pub sort: Option<SortSpec>,
    /// Rows per page; `0` disables pagination.
    pub page_size: usize,
    /// Zero-based page index, clamped to the last valid page.
    pub page: usize,
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Render-ready slice of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Projection {
    pub rows: Vec<Entity>,
    /// Entities in the snapshot before search and filters.
    pub total: usize,
    /// Entities left after search and filters.
    pub matched: usize,
    /// Page actually used for slicing.
    pub page: usize,
    pub page_count: usize,
}

/// Projects snapshots for one stream.
#[derive(Debug, Clone, Default)]
pub struct Projector {
    /// Fields searched by the full-text filter. Empty means every scalar
    /// value in the payload.
    searchable: Vec<String>,
}

impl Projector {
    pub fn new(searchable: Vec<String>) -> Self {
        Self { searchable }
    }

    pub fn project(&self, snapshot: &Snapshot, view: &ViewState) -> Projection {
        let needle = view.search.trim().to_lowercase();

        let mut rows: Vec<&Entity> = snapshot
            .entities
            .iter()
            .filter(|e| needle.is_empty() || self.search_matches(e, &needle))
            .filter(|e| view.filters.iter().all(|f| f.matches(e)))
            .collect();

        if let Some(sort) = &view.sort {
            // Stable: ties keep snapshot order.
            rows.sort_by(|a, b| sort.compare(a, b));
        }

        let matched = rows.len();
        let (page, range) = paginate(matched, view.page_size, view.page);
        let page_count = page_count(matched, view.page_size);

        Projection {
            rows: rows[range].iter().map(|e| (*e).clone()).collect(),
            total: snapshot.len(),
            matched,
            page,
            page_count,
        }
    }

    fn search_matches(&self, entity: &Entity, needle: &str) -> bool {
        if self.searchable.is_empty() {
            return any_scalar_contains(&entity.payload, needle);
        }
        self.searchable.iter().any(|field| {
            entity
                .field(field)
                .and_then(scalar_text)
                .is_some_and(|text| text.to_lowercase().contains(needle))
        })
    }
}

fn any_scalar_contains(value: &Value, needle: &str) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| any_scalar_contains(v, needle)),
        Value::Array(items) => items.iter().any(|v| any_scalar_contains(v, needle)),
        scalar => scalar_text(scalar).is_some_and(|t| t.to_lowercase().contains(needle)),
    }
}

fn page_count(matched: usize, page_size: usize) -> usize {
    match (matched, page_size) {
        (0, _) => 0,
        (_, 0) => 1,
        (n, size) => n.div_ceil(size),
    }
}

/// Clamp `page` to the last valid page and return the slice range.
fn paginate(matched: usize, page_size: usize, page: usize) -> (usize, std::ops::Range<usize>) {
    if page_size == 0 {
        return (0, 0..matched);
    }
    let last = page_count(matched, page_size).saturating_sub(1);
    let page = page.min(last);
    let start = page * page_size;
    let end = (start + page_size).min(matched);
    (page, start..end)
}

// ---------------------------------------------------------------------------
// Comparators
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum SortKey {
    Number(f64),
    Text(String),
}

impl SortKey {
    fn of(value: Option<&Value>) -> Option<Self> {
        match value? {
            Value::Number(n) => n.as_f64().map(SortKey::Number),
            Value::String(s) => Some(match s.trim().parse::<f64>() {
                Ok(n) => SortKey::Number(n),
                Err(_) => SortKey::Text(s.to_lowercase()),
            }),
            Value::Bool(b) => Some(SortKey::Text(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

/// Missing values sort last in either direction.
fn compare_present(a: Option<&Value>, b: Option<&Value>, descending: bool) -> Ordering {
    match (SortKey::of(a), SortKey::of(b)) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) if descending => y.cmp(&x),
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

fn rank(value: Option<&Value>, ranks: &[String]) -> usize {
    value
        .and_then(scalar_text)
        .and_then(|v| ranks.iter().position(|r| r.eq_ignore_ascii_case(&v)))
        .unwrap_or(ranks.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdentityKey;
    use chrono::Utc;
    use serde_json::json;

    fn snapshot(records: Vec<Value>) -> Snapshot {
        Snapshot::from_records(1, records, &IdentityKey::default(), None, Utc::now()).unwrap()
    }

    fn honeypots() -> Snapshot {
        snapshot(vec![
            json!({"id": 1, "type": "honeypot", "name": "ssh-east", "protocol": "ssh", "interactions": 12}),
            json!({"id": 2, "type": "honeypot", "name": "mysql-trap", "protocol": "mysql", "interactions": 40}),
            json!({"id": 3, "type": "honeypot", "name": "ssh-west", "protocol": "ssh", "interactions": 31}),
            json!({"id": 4, "type": "honeypot", "name": "http-decoy", "protocol": "http", "interactions": 7}),
            json!({"id": 5, "type": "honeypot", "name": "ftp-bait", "protocol": "ftp", "interactions": 3}),
        ])
    }

    fn ids(projection: &Projection) -> Vec<String> {
        projection.rows.iter().map(|e| e.identity.to_string()).collect()
    }

    #[test]
    fn test_search_filter_sort_and_clamp() {
        let projector = Projector::new(vec!["name".into(), "protocol".into()]);
        let view = ViewState {
            search: "SSH".into(),
            filters: vec![FieldFilter::new("type", "honeypot")],
            sort: Some(SortSpec::descending("interactions")),
            page_size: 2,
            page: 1,
        };

        let projection = projector.project(&honeypots(), &view);

        assert_eq!(ids(&projection), vec!["3", "1"]);
        assert_eq!(projection.matched, 2);
        assert_eq!(projection.total, 5);
        assert_eq!(projection.page_count, 1);
        assert_eq!(projection.page, 0, "page 1 clamps to the only page");
    }

    #[test]
    fn test_projection_is_idempotent() {
        let projector = Projector::default();
        let snap = honeypots();
        let view = ViewState {
            sort: Some(SortSpec::ascending("name")),
            page_size: 3,
            ..ViewState::default()
        };
        assert_eq!(projector.project(&snap, &view), projector.project(&snap, &view));
    }

    #[test]
    fn test_pagination_slices_and_clamps() {
        let projector = Projector::default();
        let snap = honeypots();
        let mut view = ViewState {
            sort: Some(SortSpec::ascending("id")),
            page_size: 2,
            page: 1,
            ..ViewState::default()
        };

        let second = projector.project(&snap, &view);
        assert_eq!(ids(&second), vec!["3", "4"]);
        assert_eq!(second.page_count, 3);

        view.page = 99;
        let clamped = projector.project(&snap, &view);
        assert_eq!(clamped.page, 2);
        assert_eq!(ids(&clamped), vec!["5"]);
    }

    #[test]
    fn test_empty_result_has_no_pages() {
        let projector = Projector::default();
        let view = ViewState {
            search: "nothing-matches".into(),
            page_size: 10,
            page: 4,
            ..ViewState::default()
        };
        let projection = projector.project(&honeypots(), &view);
        assert!(projection.rows.is_empty());
        assert_eq!(projection.page_count, 0);
        assert_eq!(projection.page, 0);
    }

    #[test]
    fn test_ranked_sort_breaks_ties_by_insertion_order() {
        let snap = snapshot(vec![
            json!({"id": "a", "priority": "low"}),
            json!({"id": "b", "priority": "critical"}),
            json!({"id": "c", "priority": "high"}),
            json!({"id": "d", "priority": "critical"}),
            json!({"id": "e", "priority": "unknown"}),
        ]);
        let view = ViewState {
            sort: Some(SortSpec::ranked("priority", ["critical", "high", "medium", "low"])),
            ..ViewState::default()
        };
        let projection = Projector::default().project(&snap, &view);
        assert_eq!(ids(&projection), vec!["b", "d", "c", "a", "e"]);
    }

    #[test]
    fn test_missing_values_sort_last() {
        let snap = snapshot(vec![
            json!({"id": 1}),
            json!({"id": 2, "risk": 10}),
            json!({"id": 3, "risk": 55}),
        ]);
        let desc = ViewState {
            sort: Some(SortSpec::descending("risk")),
            ..ViewState::default()
        };
        let asc = ViewState {
            sort: Some(SortSpec::ascending("risk")),
            ..ViewState::default()
        };
        let projector = Projector::default();
        assert_eq!(ids(&projector.project(&snap, &desc)), vec!["3", "2", "1"]);
        assert_eq!(ids(&projector.project(&snap, &asc)), vec!["2", "3", "1"]);
    }

    #[test]
    fn test_search_matches_numbers_and_nested_fields() {
        let snap = snapshot(vec![
            json!({"id": 1, "pid": 4412, "name": "powershell.exe", "user": {"name": "SYSTEM"}}),
            json!({"id": 2, "pid": 96, "name": "explorer.exe", "user": {"name": "alice"}}),
        ]);
        let projector = Projector::default();
        let by_pid = ViewState {
            search: "441".into(),
            ..ViewState::default()
        };
        let by_user = ViewState {
            search: "system".into(),
            ..ViewState::default()
        };
        assert_eq!(ids(&projector.project(&snap, &by_pid)), vec!["1"]);
        assert_eq!(ids(&projector.project(&snap, &by_user)), vec!["1"]);
    }

    #[test]
    fn test_filters_combine_with_and() {
        let snap = snapshot(vec![
            json!({"id": 1, "severity": "high", "source": "honeypot"}),
            json!({"id": 2, "severity": "high", "source": "threat_detector"}),
            json!({"id": 3, "severity": "low", "source": "honeypot"}),
        ]);
        let view = ViewState {
            filters: vec![
                FieldFilter::new("severity", "high"),
                FieldFilter::new("source", "honeypot"),
            ],
            ..ViewState::default()
        };
        assert_eq!(ids(&Projector::default().project(&snap, &view)), vec!["1"]);
    }

    #[test]
    fn test_parse_view_arguments() {
        assert_eq!(
            "type=honeypot".parse::<FieldFilter>().unwrap(),
            FieldFilter::new("type", "honeypot")
        );
        assert!("novalue".parse::<FieldFilter>().is_err());

        assert_eq!(
            "interactions:desc".parse::<SortSpec>().unwrap(),
            SortSpec::descending("interactions")
        );
        assert_eq!("name".parse::<SortSpec>().unwrap(), SortSpec::ascending("name"));
        assert_eq!(
            "priority:rank=critical,high".parse::<SortSpec>().unwrap(),
            SortSpec::ranked("priority", ["critical", "high"])
        );
        assert!("x:sideways".parse::<SortSpec>().is_err());
    }
}
