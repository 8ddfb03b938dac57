use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use licmirror_core::{
    merge_documents, FetchedDocument, MirrorQuery, MirrorRecord, PagedResult, Predicate, SortSpec,
    SourceKind,
};
use tokio::sync::RwLock;

use crate::{AuditEntry, AuditLog, AuditQuery, MirrorStore, NewAuditEntry, StoreError};

/// In-process mirror store. Each write swaps a whole table snapshot under the
/// lock, so readers see either the old rows or the new ones.
#[derive(Debug, Default)]
pub struct MemoryMirrorStore {
    tables: RwLock<HashMap<SourceKind, Vec<MirrorRecord>>>,
    next_id: AtomicI64,
}

impl MemoryMirrorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn filtered(
        rows: &[MirrorRecord],
        predicate: &Predicate,
        sort: &SortSpec,
    ) -> Vec<MirrorRecord> {
        let mut matching: Vec<MirrorRecord> = rows
            .iter()
            .filter(|row| predicate.matches(&row.document))
            .cloned()
            .collect();
        matching.sort_by(|a, b| sort.compare(a, b));
        matching
    }
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    async fn replace_all(
        &self,
        source: SourceKind,
        documents: Vec<FetchedDocument>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let rows: Vec<MirrorRecord> = documents
            .into_iter()
            .map(|doc| MirrorRecord {
                id: self.allocate_id(),
                external_key: doc.external_key,
                document: doc.document,
                updated_at: now,
            })
            .collect();
        let written = rows.len() as u64;
        self.tables.write().await.insert(source, rows);
        Ok(written)
    }

    async fn upsert_by_key(
        &self,
        source: SourceKind,
        documents: Vec<FetchedDocument>,
    ) -> Result<u64, StoreError> {
        if documents.iter().any(|doc| doc.external_key.is_none()) {
            return Err(StoreError::MissingExternalKey(source));
        }

        let mut tables = self.tables.write().await;
        let mut next = tables.get(&source).cloned().unwrap_or_default();
        let now = Utc::now();
        let mut touched = std::collections::HashSet::new();

        for doc in documents {
            let Some(key) = doc.external_key else {
                continue;
            };
            match next
                .iter_mut()
                .find(|row| row.external_key.as_deref() == Some(key.as_str()))
            {
                Some(row) => {
                    merge_documents(&mut row.document, doc.document);
                    row.updated_at = now;
                }
                None => next.push(MirrorRecord {
                    id: self.allocate_id(),
                    external_key: Some(key.clone()),
                    document: doc.document,
                    updated_at: now,
                }),
            }
            touched.insert(key);
        }

        tables.insert(source, next);
        Ok(touched.len() as u64)
    }

    async fn delete_by_key(
        &self,
        source: SourceKind,
        external_key: &str,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let Some(rows) = tables.get_mut(&source) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| row.external_key.as_deref() != Some(external_key));
        Ok((before - rows.len()) as u64)
    }

    async fn query_page(
        &self,
        source: SourceKind,
        query: &MirrorQuery,
    ) -> Result<PagedResult<MirrorRecord>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables.get(&source).map(Vec::as_slice).unwrap_or_default();
        let matching = Self::filtered(rows, &query.predicate, &query.sort);
        Ok(PagedResult::from_sorted(matching, query.page))
    }

    async fn select_all(
        &self,
        source: SourceKind,
        predicate: &Predicate,
        sort: &SortSpec,
    ) -> Result<Vec<MirrorRecord>, StoreError> {
        let tables = self.tables.read().await;
        let rows = tables.get(&source).map(Vec::as_slice).unwrap_or_default();
        Ok(Self::filtered(rows, predicate, sort))
    }

    async fn count(&self, source: SourceKind, predicate: &Predicate) -> Result<u64, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&source)
            .map(|rows| {
                rows.iter()
                    .filter(|row| predicate.matches(&row.document))
                    .count() as u64
            })
            .unwrap_or(0))
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    next_id: AtomicI64,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, oldest first.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    /// Inserts an entry with an explicit timestamp.
    pub async fn append_at(&self, entry: NewAuditEntry, created_at: DateTime<Utc>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.write().await.push(AuditEntry {
            id,
            level: entry.level.as_str().to_string(),
            message: entry.message,
            path: entry.path,
            method: entry.method,
            ip_address: entry.ip_address,
            data: entry.data,
            created_at,
        });
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: NewAuditEntry) -> Result<(), StoreError> {
        self.append_at(entry, Utc::now()).await;
        Ok(())
    }

    async fn list(&self, query: &AuditQuery) -> Result<PagedResult<AuditEntry>, StoreError> {
        let entries = self.entries.read().await;
        let mut matching: Vec<AuditEntry> = entries
            .iter()
            .filter(|entry| query.matches(entry))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(PagedResult::from_sorted(matching, query.page))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|entry| entry.created_at >= cutoff);
        Ok((before - entries.len()) as u64)
    }
}
