use std::cmp::Ordering;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{JsonPath, MirrorRecord};

/// Input errors raised before any store access.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("page must be a positive integer, got {0:?}")]
    InvalidPage(String),
    #[error("limit must be between 1 and {max}, got {requested:?}")]
    InvalidPageSize { requested: String, max: u32 },
    #[error("invalid value {value:?} for {name}: {reason}")]
    InvalidFilter {
        name: String,
        value: String,
        reason: String,
    },
    #[error("sort order must be `asc` or `desc`, got {0:?}")]
    InvalidSortOrder(String),
}

/// Boolean coercion shared by every store: `true`, `"True"`, `"1"` are truthy,
/// everything else (including a missing value) is not.
pub fn is_truthy_text(text: &str) -> bool {
    matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "1")
}

/// Filter over mirrored documents, compiled from per-source filter maps.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    /// Case-insensitive substring match.
    ContainsCi { path: JsonPath, needle: String },
    /// Textual equality.
    Equals { path: JsonPath, value: String },
    /// Boolean-coerced match; a missing value counts as false.
    Flag { path: JsonPath, expected: bool },
}

impl Predicate {
    /// Conjunction that drops trivially-true parts.
    pub fn and(parts: Vec<Predicate>) -> Predicate {
        let mut parts: Vec<_> = parts.into_iter().filter(|p| !p.is_true()).collect();
        match parts.len() {
            0 => Predicate::True,
            1 => parts.remove(0),
            _ => Predicate::All(parts),
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Predicate::True)
    }

    pub fn matches(&self, document: &JsonValue) -> bool {
        match self {
            Predicate::True => true,
            Predicate::All(parts) => parts.iter().all(|p| p.matches(document)),
            Predicate::Any(parts) => parts.iter().any(|p| p.matches(document)),
            Predicate::ContainsCi { path, needle } => path
                .text_in(document)
                .map(|text| text.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            Predicate::Equals { path, value } => path
                .text_in(document)
                .map(|text| text == value.as_str())
                .unwrap_or(false),
            Predicate::Flag { path, expected } => {
                let actual = path
                    .text_in(document)
                    .map(|text| is_truthy_text(&text))
                    .unwrap_or(false);
                actual == *expected
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            _ => Err(QueryError::InvalidSortOrder(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortKey {
    UpdatedAt,
    Path(JsonPath),
}

/// Ordering for a query. Ties are always broken by row id in the same
/// direction; missing path values sort last either way.
#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn updated_at_desc() -> Self {
        Self {
            key: SortKey::UpdatedAt,
            direction: SortDirection::Desc,
        }
    }

    pub fn by_path(path: impl Into<JsonPath>, direction: SortDirection) -> Self {
        Self {
            key: SortKey::Path(path.into()),
            direction,
        }
    }

    pub fn compare(&self, a: &MirrorRecord, b: &MirrorRecord) -> Ordering {
        let directed = |ord: Ordering| match self.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        let primary = match &self.key {
            SortKey::UpdatedAt => directed(a.updated_at.cmp(&b.updated_at)),
            SortKey::Path(path) => {
                match (path.text_in(&a.document), path.text_in(&b.document)) {
                    (Some(x), Some(y)) => match (numeric_text(&x), numeric_text(&y)) {
                        (Some(m), Some(n)) => {
                            directed(m.total_cmp(&n)).then_with(|| directed(x.cmp(&y)))
                        }
                        (Some(_), None) => Ordering::Less,
                        (None, Some(_)) => Ordering::Greater,
                        (None, None) => directed(x.cmp(&y)),
                    },
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                }
            }
        };
        primary.then_with(|| directed(a.id.cmp(&b.id)))
    }
}

/// Decimal text of the form `-?[0-9]+(\.[0-9]+)?`, the same shape the SQL
/// ordering treats as a number. Numbers sort before other text.
pub fn numeric_text(text: &str) -> Option<f64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, Some(fraction)),
        None => (digits, None),
    };
    let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !all_digits(whole) || !fraction.map_or(true, all_digits) {
        return None;
    }
    text.parse().ok()
}

/// Validated 1-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: u32, limit: u32, max_limit: u32) -> Result<Self, QueryError> {
        if page == 0 {
            return Err(QueryError::InvalidPage(page.to_string()));
        }
        if limit == 0 || limit > max_limit {
            return Err(QueryError::InvalidPageSize {
                requested: limit.to_string(),
                max: max_limit,
            });
        }
        Ok(Self { page, limit })
    }

    /// Parses raw query-string values, applying `default_limit` when absent.
    pub fn parse(
        page: Option<&str>,
        limit: Option<&str>,
        default_limit: u32,
        max_limit: u32,
    ) -> Result<Self, QueryError> {
        let page = match page.map(str::trim).filter(|v| !v.is_empty()) {
            None => 1,
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| QueryError::InvalidPage(raw.to_string()))?,
        };
        let limit = match limit.map(str::trim).filter(|v| !v.is_empty()) {
            None => default_limit,
            Some(raw) => raw.parse::<u32>().map_err(|_| QueryError::InvalidPageSize {
                requested: raw.to_string(),
                max: max_limit,
            })?,
        };
        Self::new(page, limit, max_limit)
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorQuery {
    pub predicate: Predicate,
    pub sort: SortSpec,
    pub page: PageRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PagedResult<T> {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub items: Vec<T>,
}

impl<T> PagedResult<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PagedResult<U> {
        PagedResult {
            page: self.page,
            limit: self.limit,
            total: self.total,
            items: self.items.into_iter().map(f).collect(),
        }
    }

    /// Slices an already filtered and sorted collection.
    pub fn from_sorted(all: Vec<T>, page: PageRequest) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .collect();
        Self {
            page: page.page,
            limit: page.limit,
            total,
            items,
        }
    }
}
