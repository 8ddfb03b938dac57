//! Core mirror model, document paths and date helpers for the license mirror.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

mod query;

pub use query::{
    is_truthy_text, numeric_text, MirrorQuery, PageRequest, PagedResult, Predicate, QueryError,
    SortDirection, SortKey, SortSpec,
};

/// One of the five upstream systems mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Arca,
    Iiko,
    Tinda,
    Tsd,
    Kaspi,
}

/// How a source's mirror table is brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    FullReplace,
    UpsertByKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source {0:?}")]
pub struct UnknownSource(pub String);

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Arca,
        SourceKind::Iiko,
        SourceKind::Tinda,
        SourceKind::Tsd,
        SourceKind::Kaspi,
    ];

    /// URL and config slug.
    pub fn slug(self) -> &'static str {
        match self {
            SourceKind::Arca => "arca",
            SourceKind::Iiko => "iiko",
            SourceKind::Tinda => "tinda",
            SourceKind::Tsd => "tsd",
            SourceKind::Kaspi => "kaspi",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            SourceKind::Arca => "ARCA",
            SourceKind::Iiko => "iiko",
            SourceKind::Tinda => "Tinda",
            SourceKind::Tsd => "TSD",
            SourceKind::Kaspi => "Kaspi",
        }
    }

    /// Mirror table name. Stores interpolate this into SQL, so it must stay a
    /// closed set of literals.
    pub fn table_name(self) -> &'static str {
        match self {
            SourceKind::Arca => "licenses_arca",
            SourceKind::Iiko => "licenses_iiko",
            SourceKind::Tinda => "tinda_users",
            SourceKind::Tsd => "tsd_users",
            SourceKind::Kaspi => "kaspi_users",
        }
    }

    pub fn strategy(self) -> SyncStrategy {
        match self {
            SourceKind::Kaspi => SyncStrategy::UpsertByKey,
            _ => SyncStrategy::FullReplace,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for SourceKind {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.slug() == wanted)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Handoff contract from adapters into the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub external_key: Option<String>,
    pub document: JsonValue,
}

impl FetchedDocument {
    pub fn new(document: JsonValue) -> Self {
        Self {
            external_key: None,
            document,
        }
    }

    pub fn keyed(external_key: impl Into<String>, document: JsonValue) -> Self {
        Self {
            external_key: Some(external_key.into()),
            document,
        }
    }
}

/// A row of a mirror table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub id: i64,
    pub external_key: Option<String>,
    pub document: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// Dotted path into a JSON document, e.g. `license.organization.name`.
///
/// Numeric segments index into arrays, matching Postgres `#>>` semantics.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsonPath(Vec<String>);

impl JsonPath {
    pub fn parse(dotted: &str) -> Self {
        Self(
            dotted
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn lookup<'a>(&self, document: &'a JsonValue) -> Option<&'a JsonValue> {
        let mut current = document;
        for segment in &self.0 {
            current = match current {
                JsonValue::Object(map) => map.get(segment)?,
                JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Text rendering of the value at this path: strings as-is, JSON null or a
    /// missing path as `None`, anything else as compact JSON.
    pub fn text_in<'a>(&self, document: &'a JsonValue) -> Option<Cow<'a, str>> {
        match self.lookup(document)? {
            JsonValue::Null => None,
            JsonValue::String(text) => Some(Cow::Borrowed(text.as_str())),
            other => Some(Cow::Owned(other.to_string())),
        }
    }
}

impl From<&str> for JsonPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Shallow merge with the semantics of Postgres `jsonb || jsonb` on objects:
/// keys from `fresh` win, keys only present in `existing` survive.
pub fn merge_documents(existing: &mut JsonValue, fresh: JsonValue) {
    match (existing, fresh) {
        (JsonValue::Object(current), JsonValue::Object(incoming)) => {
            current.extend(incoming);
        }
        (slot, incoming) => *slot = incoming,
    }
}

/// Reformats an upstream timestamp with `pattern`, returning the raw text when
/// it is not a recognised date.
pub fn reformat_date(raw: &str, pattern: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return parsed.format(pattern).to_string();
    }
    for layout in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, layout) {
            return parsed.format(pattern).to_string();
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return midnight.format(pattern).to_string();
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_kind_parses_slugs_case_insensitively() {
        assert_eq!("TSD".parse::<SourceKind>().unwrap(), SourceKind::Tsd);
        assert_eq!(" kaspi ".parse::<SourceKind>().unwrap(), SourceKind::Kaspi);
        assert!("onec".parse::<SourceKind>().is_err());
        assert_eq!(SourceKind::Kaspi.strategy(), SyncStrategy::UpsertByKey);
        assert_eq!(SourceKind::Arca.strategy(), SyncStrategy::FullReplace);
    }

    #[test]
    fn table_names_are_distinct() {
        let mut names: Vec<_> = SourceKind::ALL.iter().map(|k| k.table_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), SourceKind::ALL.len());
    }

    #[test]
    fn json_path_walks_objects_and_arrays() {
        let doc = json!({
            "license": {"organization": {"name": "Coffee LLP"}, "isActive": true},
            "UserLogins": [{"Login": "first"}, {"Login": "second"}],
            "count": 3,
            "gone": null
        });

        assert_eq!(
            JsonPath::parse("license.organization.name").text_in(&doc).as_deref(),
            Some("Coffee LLP")
        );
        assert_eq!(
            JsonPath::parse("UserLogins.1.Login").text_in(&doc).as_deref(),
            Some("second")
        );
        assert_eq!(
            JsonPath::parse("license.isActive").text_in(&doc).as_deref(),
            Some("true")
        );
        assert_eq!(JsonPath::parse("count").text_in(&doc).as_deref(), Some("3"));
        assert_eq!(JsonPath::parse("gone").text_in(&doc), None);
        assert_eq!(JsonPath::parse("license.missing.deeper").text_in(&doc), None);
        assert_eq!(JsonPath::parse("count.inner").lookup(&doc), None);
    }

    #[test]
    fn merge_keeps_local_only_keys() {
        let mut stored = json!({"login": "old", "note": "local"});
        merge_documents(&mut stored, json!({"login": "new", "role": 2}));
        assert_eq!(stored, json!({"login": "new", "note": "local", "role": 2}));
    }

    #[test]
    fn reformat_date_handles_common_upstream_shapes() {
        assert_eq!(
            reformat_date("2024-03-05T14:07:00Z", "%d.%m.%Y %H:%M"),
            "05.03.2024 14:07"
        );
        assert_eq!(
            reformat_date("2024-03-05T14:07:09.123456", "%Y-%m-%d %H:%M"),
            "2024-03-05 14:07"
        );
        assert_eq!(reformat_date("2024-03-05", "%d.%m.%Y"), "05.03.2024");
        assert_eq!(reformat_date("next tuesday", "%d.%m.%Y"), "next tuesday");
        assert_eq!(reformat_date("  ", "%d.%m.%Y"), "");
    }
}
