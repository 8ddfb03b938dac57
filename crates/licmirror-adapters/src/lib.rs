//! Remote source adapters for the five mirrored systems, plus the per-source
//! query and export profiles.

use std::sync::Arc;

use async_trait::async_trait;
use licmirror_core::{FetchedDocument, SourceKind};
use licmirror_storage::{UpstreamError, UpstreamHttp};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod arca;
mod http_source;
pub mod iiko;
pub mod kaspi;
pub mod profile;
pub mod tinda;
pub mod tsd;

pub use http_source::{CollectionShape, HttpAuth, HttpSource};
pub use profile::{
    ColumnFormat, ExportColumn, ExportLayout, FilterDef, FilterKind, SortField, SourceProfile,
};

/// A system whose collection is mirrored locally and which accepts admin
/// commands. Implementations log in afresh for every call.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// The complete current collection, or an error; never a partial list.
    async fn fetch_collection(&self) -> Result<Vec<FetchedDocument>, UpstreamError>;

    async fn execute(&self, command: &UpstreamCommand) -> Result<JsonValue, UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl CommandMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            CommandMethod::Get => reqwest::Method::GET,
            CommandMethod::Post => reqwest::Method::POST,
            CommandMethod::Patch => reqwest::Method::PATCH,
            CommandMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// What to do with the local mirror once the upstream accepted a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MirrorFollowUp {
    /// Re-run the source's reconcile.
    Resync,
    /// Delete the row with this key, then re-run the reconcile.
    RemoveAndResync { external_key: String },
    /// Read-only command; leave the mirror alone.
    Nothing,
}

/// A typed upstream request, relative to the source's configured base URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpstreamCommand {
    pub method: CommandMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    /// Human-readable summary for the audit log.
    pub summary: String,
    pub follow_up: MirrorFollowUp,
}

impl UpstreamCommand {
    pub fn new(method: CommandMethod, path: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            summary: summary.into(),
            follow_up: MirrorFollowUp::Resync,
        }
    }

    pub fn query(mut self, name: &str, value: impl Into<String>) -> Self {
        self.query.push((name.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn follow_up(mut self, follow_up: MirrorFollowUp) -> Self {
        self.follow_up = follow_up;
        self
    }
}

/// Rejected command input, raised before any upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct InvalidCommand {
    pub field: &'static str,
    pub reason: String,
}

pub(crate) fn require(field: &'static str, value: &str) -> Result<String, InvalidCommand> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(InvalidCommand {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// A value spliced into an upstream URL path as a single segment.
pub(crate) fn path_segment(field: &'static str, value: &str) -> Result<String, InvalidCommand> {
    let segment = require(field, value)?;
    if let Some(bad) = segment
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '?' | '#' | '&' | '%') || c.is_whitespace())
    {
        return Err(InvalidCommand {
            field,
            reason: format!("must not contain {bad:?}"),
        });
    }
    Ok(segment)
}

/// Accepts `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS` and returns the trimmed text.
pub(crate) fn upstream_date(field: &'static str, value: &str) -> Result<String, InvalidCommand> {
    let date = require(field, value)?;
    let parsed = chrono::NaiveDate::parse_from_str(&date, "%Y-%m-%d").is_ok()
        || chrono::NaiveDateTime::parse_from_str(&date, "%Y-%m-%dT%H:%M:%S").is_ok();
    if !parsed {
        return Err(InvalidCommand {
            field,
            reason: format!("expected YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS, got {date:?}"),
        });
    }
    Ok(date)
}

/// Connection settings for every source; `None` means the source is not
/// configured and is left out of the registry.
#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub arca: Option<arca::ArcaSettings>,
    pub iiko: Option<iiko::IikoSettings>,
    pub tinda: Option<tinda::TindaSettings>,
    pub tsd: Option<tsd::TsdSettings>,
    pub kaspi: Option<kaspi::KaspiSettings>,
}

/// Builds one adapter per configured source.
pub fn build_remote_sources(
    settings: &SourceSettings,
    http: &UpstreamHttp,
) -> Vec<Arc<dyn RemoteSource>> {
    let mut sources: Vec<Arc<dyn RemoteSource>> = Vec::new();
    if let Some(cfg) = &settings.arca {
        sources.push(Arc::new(arca::source(cfg, http.clone())));
    }
    if let Some(cfg) = &settings.iiko {
        sources.push(Arc::new(iiko::source(cfg, http.clone())));
    }
    if let Some(cfg) = &settings.tinda {
        sources.push(Arc::new(tinda::source(cfg, http.clone())));
    }
    if let Some(cfg) = &settings.tsd {
        sources.push(Arc::new(tsd::source(cfg, http.clone())));
    }
    if let Some(cfg) = &settings.kaspi {
        sources.push(Arc::new(kaspi::KaspiSource::new(cfg.clone(), http.clone())));
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use licmirror_storage::HttpClientConfig;

    #[test]
    fn only_configured_sources_are_built() {
        let http = UpstreamHttp::new(&HttpClientConfig::default()).unwrap();
        let settings = SourceSettings {
            iiko: Some(iiko::IikoSettings {
                api_url: "https://iiko.test/license".into(),
                api_key: "k".into(),
            }),
            tsd: Some(tsd::TsdSettings {
                base_url: "https://tsd.test/".into(),
                username: "admin".into(),
                password: "pw".into(),
                device_id: "dev".into(),
                device_name: "Admin PC".into(),
                role: "Admin".into(),
            }),
            ..SourceSettings::default()
        };
        let kinds: Vec<_> = build_remote_sources(&settings, &http)
            .iter()
            .map(|s| s.kind())
            .collect();
        assert_eq!(kinds, vec![SourceKind::Iiko, SourceKind::Tsd]);
    }

    #[test]
    fn require_trims_and_rejects_blank() {
        assert_eq!(require("login", "  bob ").unwrap(), "bob");
        assert_eq!(require("login", "   ").unwrap_err().field, "login");
    }

    #[test]
    fn path_segments_reject_url_syntax() {
        assert_eq!(path_segment("user_id", " 42 ").unwrap(), "42");
        for bad in ["a/b", "7?x=1", "7#frag", "7 8", "7%2F8", "7&date=1"] {
            assert_eq!(path_segment("user_id", bad).unwrap_err().field, "user_id", "{bad}");
        }
    }

    #[test]
    fn upstream_dates_are_parsed_before_use() {
        assert_eq!(upstream_date("d", "2026-01-01").unwrap(), "2026-01-01");
        assert!(upstream_date("d", "2026-01-01T10:30:00").is_ok());
        assert!(upstream_date("d", "2026-13-01").is_err());
        assert!(upstream_date("d", "2026-01-01?x=1").is_err());
        assert!(upstream_date("d", "tomorrow").is_err());
    }
}
