use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{AppConfig, MirrorService, SourceEntry, SourceRegistry};

/// Registry entries that get a cron job: enabled and backed by credentials.
pub fn scheduled_syncs<'a>(
    registry: &'a SourceRegistry,
    service: &MirrorService,
) -> Vec<&'a SourceEntry> {
    registry
        .enabled()
        .filter(|entry| {
            let configured = service.is_configured(entry.source);
            if !configured {
                warn!(
                    source = %entry.source,
                    name = %entry.display_name,
                    "enabled in registry but not configured; not scheduled"
                );
            }
            configured
        })
        .collect()
}

/// Builds (but does not start) the sync and audit-retention jobs, or `None`
/// when scheduling is switched off.
pub async fn maybe_build_scheduler(
    config: &AppConfig,
    registry: &SourceRegistry,
    service: Arc<MirrorService>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for entry in scheduled_syncs(registry, &service) {
        let kind = entry.source;
        let cron = &entry.sync_cron;
        let service = service.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let service = service.clone();
            Box::pin(async move {
                // Failures are already logged and audited by the reconciler.
                if service.sync(kind).await.is_err() {
                    warn!(source = %kind, "scheduled sync failed");
                }
            })
        })
        .with_context(|| format!("creating sync job for {kind} with cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(source = %kind, name = %entry.display_name, cron = %cron, "scheduled sync");
    }

    let retention = chrono::Duration::days(config.audit_retention_days);
    let prune_service = service.clone();
    let job = Job::new_async(config.audit_prune_cron.as_str(), move |_uuid, _l| {
        let service = prune_service.clone();
        Box::pin(async move {
            if let Err(err) = service.prune_audit(retention).await {
                warn!(error = %err, "audit retention job failed");
            }
        })
    })
    .with_context(|| format!("creating audit retention job for cron {}", config.audit_prune_cron))?;
    sched.add(job).await.context("adding scheduler job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use licmirror_adapters::SourceSettings;
    use licmirror_core::SourceKind;
    use licmirror_storage::{MemoryAuditLog, MemoryMirrorStore};
    use std::path::PathBuf;

    use crate::reconcile::tests::StubSource;
    use crate::SourceEntry;

    fn entry(source: SourceKind, enabled: bool, cron: &str) -> SourceEntry {
        SourceEntry {
            source,
            display_name: source.display_name().to_string(),
            enabled,
            sync_cron: cron.to_string(),
        }
    }

    fn config(scheduler_enabled: bool) -> AppConfig {
        AppConfig {
            database_url: "postgres://unused".into(),
            database_max_connections: 1,
            bind_addr: "127.0.0.1:0".into(),
            admin_token: None,
            scheduler_enabled,
            audit_retention_days: 7,
            audit_prune_cron: "0 0 3 * * *".into(),
            user_agent: "test".into(),
            http_timeout_secs: 5,
            workspace_root: PathBuf::from("."),
            sources: SourceSettings::default(),
        }
    }

    fn scheduled_pairs(registry: &SourceRegistry, service: &MirrorService) -> Vec<(SourceKind, String)> {
        scheduled_syncs(registry, service)
            .into_iter()
            .map(|entry| (entry.source, entry.sync_cron.clone()))
            .collect()
    }

    fn service() -> MirrorService {
        MirrorService::new(
            Arc::new(MemoryMirrorStore::new()),
            Arc::new(MemoryAuditLog::new()),
        )
        .with_source(Arc::new(StubSource::new(SourceKind::Iiko, Vec::new())))
        .with_source(Arc::new(StubSource::new(SourceKind::Tsd, Vec::new())))
    }

    #[test]
    fn only_enabled_and_configured_sources_are_scheduled() {
        let registry = SourceRegistry {
            sources: vec![
                entry(SourceKind::Iiko, true, "0 0 * * * *"),
                entry(SourceKind::Tsd, false, "0 10 * * * *"),
                entry(SourceKind::Arca, true, "0 20 * * * *"),
            ],
        };
        assert_eq!(
            scheduled_pairs(&registry, &service()),
            vec![(SourceKind::Iiko, "0 0 * * * *".to_string())]
        );
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let registry = SourceRegistry {
            sources: vec![entry(SourceKind::Iiko, true, "0 0 * * * *")],
        };
        let built = maybe_build_scheduler(&config(false), &registry, Arc::new(service()))
            .await
            .unwrap();
        assert!(built.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_sync_job_keeps_ticking() {
        let audit = Arc::new(MemoryAuditLog::new());
        let service = MirrorService::new(Arc::new(MemoryMirrorStore::new()), audit.clone())
            .with_source(Arc::new(StubSource::scripted(
                SourceKind::Tsd,
                vec![Err("connection refused".to_string())],
            )));
        let registry = SourceRegistry {
            sources: vec![entry(SourceKind::Tsd, true, "* * * * * *")],
        };

        let mut sched = maybe_build_scheduler(&config(true), &registry, Arc::new(service))
            .await
            .unwrap()
            .expect("scheduler is enabled");
        sched.start().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(4_500)).await;
        sched.shutdown().await.unwrap();

        let failures = audit
            .entries()
            .await
            .into_iter()
            .filter(|entry| entry.message.starts_with("TSD sync failed"))
            .count();
        assert!(failures >= 2, "expected repeated failed runs, saw {failures}");
    }
}
