//! Mirror tables, audit log and upstream HTTP plumbing for the license mirror.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use licmirror_core::{
    FetchedDocument, MirrorQuery, MirrorRecord, PageRequest, PagedResult, Predicate, SortSpec,
    SourceKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::error;

pub mod http;
pub mod memory;
pub mod postgres;

pub use http::{join_url, HttpClientConfig, UpstreamError, UpstreamHttp, UpstreamResponse};
pub use memory::{MemoryAuditLog, MemoryMirrorStore};
pub use postgres::{PgAuditLog, PgMirrorStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} upsert requires every document to carry an external key")]
    MissingExternalKey(SourceKind),
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Storage contract for the five mirror tables.
///
/// Every write is atomic: readers observe either the table before the call or
/// the table after it.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Deletes every row of the source's table and inserts `documents` in one
    /// transaction. Returns the number of rows written.
    async fn replace_all(
        &self,
        source: SourceKind,
        documents: Vec<FetchedDocument>,
    ) -> Result<u64, StoreError>;

    /// Inserts or merges rows by external key without deleting anything.
    async fn upsert_by_key(
        &self,
        source: SourceKind,
        documents: Vec<FetchedDocument>,
    ) -> Result<u64, StoreError>;

    async fn delete_by_key(&self, source: SourceKind, external_key: &str)
        -> Result<u64, StoreError>;

    async fn query_page(
        &self,
        source: SourceKind,
        query: &MirrorQuery,
    ) -> Result<PagedResult<MirrorRecord>, StoreError>;

    async fn select_all(
        &self,
        source: SourceKind,
        predicate: &Predicate,
        sort: &SortSpec,
    ) -> Result<Vec<MirrorRecord>, StoreError>;

    async fn count(&self, source: SourceKind, predicate: &Predicate) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Warning => "WARNING",
            AuditLevel::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub path: Option<String>,
    pub method: Option<String>,
    pub ip_address: Option<String>,
    pub data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub level: AuditLevel,
    pub message: String,
    pub path: Option<String>,
    pub method: Option<String>,
    pub ip_address: Option<String>,
    pub data: Option<JsonValue>,
}

impl NewAuditEntry {
    pub fn new(level: AuditLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            path: None,
            method: None,
            ip_address: None,
            data: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(AuditLevel::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(AuditLevel::Error, message)
    }

    pub fn with_request(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self.path = Some(path.into());
        self
    }

    pub fn with_ip(mut self, ip_address: Option<String>) -> Self {
        self.ip_address = ip_address;
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditQuery {
    pub page: PageRequest,
    /// Case-insensitive exact level match.
    pub level: Option<String>,
    /// Case-insensitive substring of the message.
    pub search: Option<String>,
}

impl AuditQuery {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        let level_ok = self
            .level
            .as_deref()
            .map(|level| entry.level.eq_ignore_ascii_case(level))
            .unwrap_or(true);
        let search_ok = self
            .search
            .as_deref()
            .map(|needle| {
                entry
                    .message
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
            .unwrap_or(true);
        level_ok && search_ok
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> Result<(), StoreError>;

    /// Newest first.
    async fn list(&self, query: &AuditQuery) -> Result<PagedResult<AuditEntry>, StoreError>;

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Appends an entry, logging instead of failing when the write is lost.
    async fn record(&self, entry: NewAuditEntry) {
        let message = entry.message.clone();
        if let Err(err) = self.append(entry).await {
            error!(error = %err, message = %message, "failed to write audit entry");
        }
    }
}

/// Escapes `%`, `_` and `\` for use inside an ILIKE pattern.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}
