use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use licmirror_adapters::{MirrorFollowUp, RemoteSource, SourceProfile, UpstreamCommand};
use licmirror_core::{MirrorQuery, PageRequest, PagedResult, SourceKind};
use licmirror_storage::{AuditEntry, AuditLog, AuditQuery, MirrorStore, NewAuditEntry};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use crate::export::{export_file_name, ExportFile, ExportTable};
use crate::reconcile::{ReconcileReport, Reconciler, SyncFailed};
use crate::ServiceError;

pub const LOG_DEFAULT_LIMIT: u32 = 20;
pub const LOG_MAX_LIMIT: u32 = 200;

/// Result of a command the upstream accepted.
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub upstream: JsonValue,
    /// Row count after the follow-up reconcile; `None` when no reconcile ran
    /// or it failed.
    pub mirror_records: Option<u64>,
}

/// Entry point for everything the API and the scheduler do with the mirror.
pub struct MirrorService {
    store: Arc<dyn MirrorStore>,
    audit: Arc<dyn AuditLog>,
    reconciler: Reconciler,
    sources: BTreeMap<SourceKind, Arc<dyn RemoteSource>>,
}

impl MirrorService {
    pub fn new(store: Arc<dyn MirrorStore>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), audit.clone()),
            store,
            audit,
            sources: BTreeMap::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn RemoteSource>) -> Self {
        self.sources.insert(source.kind(), source);
        self
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    pub fn is_configured(&self, kind: SourceKind) -> bool {
        self.sources.contains_key(&kind)
    }

    pub fn configured_sources(&self) -> Vec<SourceKind> {
        self.sources.keys().copied().collect()
    }

    fn source(&self, kind: SourceKind) -> Result<&Arc<dyn RemoteSource>, ServiceError> {
        self.sources
            .get(&kind)
            .ok_or(ServiceError::SourceNotConfigured(kind))
    }

    pub async fn sync(&self, kind: SourceKind) -> Result<ReconcileReport, ServiceError> {
        let source = self.source(kind)?;
        Ok(self.reconciler.reconcile(source.as_ref()).await?)
    }

    /// Reconciles every configured source in turn; one failure does not stop
    /// the others.
    pub async fn sync_all(&self) -> Vec<Result<ReconcileReport, SyncFailed>> {
        let mut results = Vec::with_capacity(self.sources.len());
        for source in self.sources.values() {
            results.push(self.reconciler.reconcile(source.as_ref()).await);
        }
        results
    }

    /// One page of mirrored documents. Reads the local table only, so it
    /// works for sources without upstream credentials too.
    pub async fn query(
        &self,
        kind: SourceKind,
        params: &BTreeMap<String, String>,
    ) -> Result<PagedResult<JsonValue>, ServiceError> {
        let profile = SourceProfile::for_source(kind);
        let query = MirrorQuery {
            predicate: profile.compile_filters(params)?,
            sort: profile.resolve_sort(params)?,
            page: profile.page_request(params)?,
        };
        let page = self.store.query_page(kind, &query).await?;
        Ok(page.map(|record| profile.project(record.document)))
    }

    /// Filtered table as an xlsx workbook, in the profile's default order.
    pub async fn export(
        &self,
        kind: SourceKind,
        params: &BTreeMap<String, String>,
    ) -> Result<ExportFile, ServiceError> {
        let profile = SourceProfile::for_source(kind);
        let predicate = profile.compile_filters(params)?;
        let records = self
            .store
            .select_all(kind, &predicate, &profile.default_sort)
            .await?;
        let documents: Vec<JsonValue> = records
            .into_iter()
            .map(|record| profile.project(record.document))
            .collect();

        let table = ExportTable::flatten(&profile.export, &documents);
        let bytes = table.render_xlsx()?;
        let file_name = export_file_name(kind, profile.export.file_noun, Utc::now());
        info!(source = %kind, rows = documents.len(), file = %file_name, "export built");
        Ok(ExportFile {
            file_name,
            bytes,
            rows: documents.len(),
        })
    }

    /// Sends `command` upstream, then brings the mirror in line according to
    /// its follow-up. A failing follow-up reconcile does not fail the call.
    pub async fn mutate(
        &self,
        kind: SourceKind,
        command: UpstreamCommand,
    ) -> Result<MutationOutcome, ServiceError> {
        let source = self.source(kind)?;
        let call = json!({
            "method": command.method,
            "path": command.path,
        });

        let upstream = match source.execute(&command).await {
            Ok(reply) => reply,
            Err(error) => {
                warn!(source = %kind, error = %error, "upstream rejected command");
                self.audit
                    .record(
                        NewAuditEntry::error(format!("{} failed: {error}", command.summary))
                            .with_data(call),
                    )
                    .await;
                return Err(ServiceError::Upstream {
                    source_kind: kind,
                    error,
                });
            }
        };
        self.audit
            .record(NewAuditEntry::info(command.summary.clone()).with_data(call))
            .await;

        let mirror_records = match &command.follow_up {
            MirrorFollowUp::Nothing => None,
            MirrorFollowUp::Resync => self.resync_after_mutation(source.as_ref()).await,
            MirrorFollowUp::RemoveAndResync { external_key } => {
                if let Err(err) = self.store.delete_by_key(kind, external_key).await {
                    warn!(source = %kind, key = %external_key, error = %err, "local delete failed");
                }
                self.resync_after_mutation(source.as_ref()).await
            }
        };
        Ok(MutationOutcome {
            upstream,
            mirror_records,
        })
    }

    async fn resync_after_mutation(&self, source: &dyn RemoteSource) -> Option<u64> {
        match self.reconciler.reconcile(source).await {
            Ok(report) => Some(report.mirror_rows.unwrap_or(report.written)),
            Err(err) => {
                warn!(error = %err, "reconcile after mutation failed");
                None
            }
        }
    }

    /// Audit entries, newest first. `level` and `search` are optional.
    pub async fn logs(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<PagedResult<AuditEntry>, ServiceError> {
        let text = |name: &str| {
            params
                .get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let query = AuditQuery {
            page: PageRequest::parse(
                params.get("page").map(String::as_str),
                params.get("limit").map(String::as_str),
                LOG_DEFAULT_LIMIT,
                LOG_MAX_LIMIT,
            )?,
            level: text("level"),
            search: text("search"),
        };
        Ok(self.audit.list(&query).await?)
    }

    /// Drops audit entries older than `retention`.
    pub async fn prune_audit(&self, retention: chrono::Duration) -> Result<u64, ServiceError> {
        let removed = self.audit.prune_before(Utc::now() - retention).await?;
        info!(removed, "pruned audit log");
        Ok(removed)
    }
}
