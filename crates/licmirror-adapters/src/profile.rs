//! Per-source query and export profiles.
//!
//! A profile maps the loose filter/sort parameters an admin UI sends into the
//! generic [`Predicate`] and [`SortSpec`] the stores understand, and fixes the
//! column layout used for spreadsheet export.

use std::collections::BTreeMap;

use licmirror_core::{
    is_truthy_text, JsonPath, PageRequest, Predicate, QueryError, SortDirection, SortSpec,
    SourceKind,
};
use serde_json::Value as JsonValue;

use crate::{arca, iiko, kaspi, tinda, tsd};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterKind {
    /// Case-insensitive substring across several paths.
    Search(Vec<JsonPath>),
    /// `truthy` / `falsy` words select a boolean-coerced flag; anything else
    /// (including `all`) selects everything.
    Status {
        path: JsonPath,
        truthy: &'static str,
        falsy: &'static str,
    },
    Contains(JsonPath),
    Exact(JsonPath),
    /// Strict boolean; the value must parse as `true` or `false`.
    Flag(JsonPath),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterDef {
    pub name: &'static str,
    pub kind: FilterKind,
}

impl FilterDef {
    pub fn new(name: &'static str, kind: FilterKind) -> Self {
        Self { name, kind }
    }

    fn compile(&self, raw: &str) -> Result<Predicate, QueryError> {
        let value = raw.trim();
        let predicate = match &self.kind {
            FilterKind::Search(paths) => Predicate::Any(
                paths
                    .iter()
                    .map(|path| Predicate::ContainsCi {
                        path: path.clone(),
                        needle: value.to_string(),
                    })
                    .collect(),
            ),
            FilterKind::Status {
                path,
                truthy,
                falsy,
            } => {
                let word = value.to_ascii_lowercase();
                if word == *truthy {
                    Predicate::Flag {
                        path: path.clone(),
                        expected: true,
                    }
                } else if word == *falsy {
                    Predicate::Flag {
                        path: path.clone(),
                        expected: false,
                    }
                } else {
                    Predicate::True
                }
            }
            FilterKind::Contains(path) => Predicate::ContainsCi {
                path: path.clone(),
                needle: value.to_string(),
            },
            FilterKind::Exact(path) => Predicate::Equals {
                path: path.clone(),
                value: value.to_string(),
            },
            FilterKind::Flag(path) => {
                let expected = match value.to_ascii_lowercase().as_str() {
                    "true" | "1" => true,
                    "false" | "0" => false,
                    _ => {
                        return Err(QueryError::InvalidFilter {
                            name: self.name.to_string(),
                            value: raw.to_string(),
                            reason: "expected true or false".to_string(),
                        })
                    }
                };
                Predicate::Flag {
                    path: path.clone(),
                    expected,
                }
            }
        };
        Ok(predicate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub name: &'static str,
    pub path: JsonPath,
}

impl SortField {
    pub fn new(name: &'static str, path: &str) -> Self {
        Self {
            name,
            path: JsonPath::parse(path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnFormat {
    Text,
    /// Best-effort date reformat with a chrono pattern.
    Date(&'static str),
    YesNo {
        yes: &'static str,
        no: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportColumn {
    pub header: &'static str,
    /// First path with a non-null value wins.
    pub paths: Vec<JsonPath>,
    pub format: ColumnFormat,
}

impl ExportColumn {
    pub fn text(header: &'static str, paths: &[&str]) -> Self {
        Self::with_format(header, paths, ColumnFormat::Text)
    }

    pub fn with_format(header: &'static str, paths: &[&str], format: ColumnFormat) -> Self {
        Self {
            header,
            paths: paths.iter().map(|p| JsonPath::parse(p)).collect(),
            format,
        }
    }

    pub fn cell(&self, document: &JsonValue) -> String {
        let raw = self
            .paths
            .iter()
            .find_map(|path| path.text_in(document))
            .map(|text| text.into_owned());
        match &self.format {
            ColumnFormat::Text => raw.unwrap_or_default(),
            ColumnFormat::Date(pattern) => raw
                .map(|text| licmirror_core::reformat_date(&text, pattern))
                .unwrap_or_default(),
            ColumnFormat::YesNo { yes, no } => {
                if raw.as_deref().map(is_truthy_text).unwrap_or(false) {
                    yes.to_string()
                } else {
                    no.to_string()
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportLayout {
    pub sheet_name: &'static str,
    /// Middle part of the export file name, e.g. `licenses`.
    pub file_noun: &'static str,
    pub columns: Vec<ExportColumn>,
}

/// Everything the query engine and exporter need to know about one source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceProfile {
    pub source: SourceKind,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub filters: Vec<FilterDef>,
    pub sort_fields: Vec<SortField>,
    pub default_sort: SortSpec,
    /// Top-level document keys never returned by the API.
    pub hidden_fields: Vec<&'static str>,
    pub export: ExportLayout,
}

/// Query-string names with fixed meaning; everything else is a filter.
pub const RESERVED_PARAMS: [&str; 6] = ["page", "limit", "sort", "order", "sort_by", "sort_order"];

impl SourceProfile {
    pub fn for_source(source: SourceKind) -> Self {
        match source {
            SourceKind::Arca => arca::profile(),
            SourceKind::Iiko => iiko::profile(),
            SourceKind::Tinda => tinda::profile(),
            SourceKind::Tsd => tsd::profile(),
            SourceKind::Kaspi => kaspi::profile(),
        }
    }

    /// Compiles the filter part of `params`. Unknown names and blank values
    /// are ignored.
    pub fn compile_filters(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<Predicate, QueryError> {
        let mut parts = Vec::new();
        for (name, value) in params {
            if RESERVED_PARAMS.contains(&name.as_str()) || value.trim().is_empty() {
                continue;
            }
            if let Some(def) = self.filters.iter().find(|def| def.name == name) {
                parts.push(def.compile(value)?);
            }
        }
        Ok(Predicate::and(parts))
    }

    /// Resolves `sort`/`order` (or `sort_by`/`sort_order`). Unknown sort names
    /// fall back to the default sort; an invalid order is rejected.
    pub fn resolve_sort(&self, params: &BTreeMap<String, String>) -> Result<SortSpec, QueryError> {
        let pick = |primary: &str, alias: &str| {
            params
                .get(primary)
                .or_else(|| params.get(alias))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        let direction = pick("order", "sort_order")
            .map(str::parse::<SortDirection>)
            .transpose()?;

        let field = pick("sort", "sort_by")
            .and_then(|name| self.sort_fields.iter().find(|field| field.name == name));
        Ok(match field {
            Some(field) => SortSpec::by_path(
                field.path.clone(),
                direction.unwrap_or(SortDirection::Desc),
            ),
            None => SortSpec {
                direction: direction.unwrap_or(self.default_sort.direction),
                ..self.default_sort.clone()
            },
        })
    }

    pub fn page_request(&self, params: &BTreeMap<String, String>) -> Result<PageRequest, QueryError> {
        PageRequest::parse(
            params.get("page").map(String::as_str),
            params.get("limit").map(String::as_str),
            self.default_page_size,
            self.max_page_size,
        )
    }

    /// Removes hidden fields before a document leaves the service.
    pub fn project(&self, mut document: JsonValue) -> JsonValue {
        if let JsonValue::Object(map) = &mut document {
            for field in &self.hidden_fields {
                map.remove(*field);
            }
        }
        document
    }
}
