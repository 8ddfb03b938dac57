use std::sync::Arc;

use chrono::{DateTime, Utc};
use licmirror_adapters::RemoteSource;
use licmirror_core::{FetchedDocument, Predicate, SourceKind, SyncStrategy};
use licmirror_storage::{AuditLog, MirrorStore, NewAuditEntry, StoreError, UpstreamError};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub run_id: Uuid,
    pub source: SourceKind,
    pub strategy: SyncStrategy,
    pub fetched: usize,
    /// Rows inserted or merged; the mirror's record count for full replace.
    pub written: u64,
    /// Unkeyed documents dropped by an upsert.
    pub skipped: usize,
    /// Rows in the mirror table once the write committed; `None` when the
    /// count itself failed.
    pub mirror_rows: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum SyncCause {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
#[error("{source_kind} sync failed: {cause}")]
pub struct SyncFailed {
    pub source_kind: SourceKind,
    #[source]
    pub cause: SyncCause,
}

/// Brings one mirror table in line with its upstream collection.
///
/// The upstream fetch completes before any write starts, and each write is a
/// single store transaction, so a failed run leaves the table as it was.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn MirrorStore>,
    audit: Arc<dyn AuditLog>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn MirrorStore>, audit: Arc<dyn AuditLog>) -> Self {
        Self { store, audit }
    }

    pub async fn reconcile(&self, source: &dyn RemoteSource) -> Result<ReconcileReport, SyncFailed> {
        let kind = source.kind();
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", source = %kind, run_id = %run_id);
        self.run(source, kind, run_id).instrument(span).await
    }

    async fn run(
        &self,
        source: &dyn RemoteSource,
        kind: SourceKind,
        run_id: Uuid,
    ) -> Result<ReconcileReport, SyncFailed> {
        let started_at = Utc::now();
        match self.fetch_and_write(source, kind).await {
            Ok((fetched, written, skipped)) => {
                let mirror_rows = match self.store.count(kind, &Predicate::True).await {
                    Ok(rows) => Some(rows),
                    Err(err) => {
                        warn!(error = %err, "counting mirror rows failed");
                        None
                    }
                };
                let report = ReconcileReport {
                    run_id,
                    source: kind,
                    strategy: kind.strategy(),
                    fetched,
                    written,
                    skipped,
                    mirror_rows,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!(fetched, written, skipped, mirror_rows, "mirror reconciled");
                self.audit
                    .record(
                        NewAuditEntry::info(format!("Synced {written} {kind} records")).with_data(
                            json!({
                                "run_id": run_id,
                                "fetched": fetched,
                                "skipped": skipped,
                                "mirror_rows": mirror_rows,
                            }),
                        ),
                    )
                    .await;
                Ok(report)
            }
            Err(cause) => {
                let failure = SyncFailed {
                    source_kind: kind,
                    cause,
                };
                error!(error = %failure, "mirror reconcile failed");
                self.audit
                    .record(
                        NewAuditEntry::error(failure.to_string())
                            .with_data(json!({ "run_id": run_id })),
                    )
                    .await;
                Err(failure)
            }
        }
    }

    async fn fetch_and_write(
        &self,
        source: &dyn RemoteSource,
        kind: SourceKind,
    ) -> Result<(usize, u64, usize), SyncCause> {
        let documents = source.fetch_collection().await?;
        let fetched = documents.len();

        match kind.strategy() {
            SyncStrategy::FullReplace => {
                let written = self.store.replace_all(kind, documents).await?;
                Ok((fetched, written, 0))
            }
            SyncStrategy::UpsertByKey => {
                let (keyed, unkeyed): (Vec<FetchedDocument>, Vec<FetchedDocument>) =
                    documents.into_iter().partition(|doc| {
                        doc.external_key
                            .as_deref()
                            .is_some_and(|key| !key.trim().is_empty())
                    });
                if !unkeyed.is_empty() {
                    warn!(skipped = unkeyed.len(), "documents without external key skipped");
                }
                let written = self.store.upsert_by_key(kind, keyed).await?;
                Ok((fetched, written, unkeyed.len()))
            }
        }
    }
}
