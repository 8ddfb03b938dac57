use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use licmirror_core::SourceKind;
use licmirror_storage::postgres::{connect_pool, run_migrations};
use licmirror_sync::{connect_service, maybe_build_scheduler, AppConfig, SourceRegistry};
use licmirror_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "licmirror")]
#[command(about = "License mirror admin backend")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the admin API (and the scheduler when enabled).
    Serve,
    /// Reconcile one source, or every configured source.
    Sync { source: Option<String> },
    Migrate,
    /// Delete audit entries past the retention window.
    PruneLogs,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await?,
        Commands::Sync { source } => {
            let service = connect_service(&config).await?;
            match source {
                Some(raw) => {
                    let kind: SourceKind = raw.parse()?;
                    let report = service.sync(kind).await?;
                    println!(
                        "sync complete: source={} run_id={} fetched={} written={} skipped={} rows={}",
                        kind.slug(),
                        report.run_id,
                        report.fetched,
                        report.written,
                        report.skipped,
                        report.mirror_rows.map_or_else(|| "?".to_string(), |n| n.to_string())
                    );
                }
                None => {
                    let mut failures = 0;
                    for result in service.sync_all().await {
                        match result {
                            Ok(report) => println!(
                                "sync complete: source={} written={}",
                                report.source.slug(),
                                report.written
                            ),
                            Err(err) => {
                                failures += 1;
                                eprintln!("{err}");
                            }
                        }
                    }
                    if failures > 0 {
                        anyhow::bail!("{failures} source(s) failed to sync");
                    }
                }
            }
        }
        Commands::Migrate => {
            let pool = connect_pool(&config.database_config())
                .await
                .context("connecting to postgres")?;
            run_migrations(&pool).await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::PruneLogs => {
            let service = connect_service(&config).await?;
            let removed = service
                .prune_audit(chrono::Duration::days(config.audit_retention_days))
                .await?;
            println!("pruned {removed} audit entries");
        }
    }

    Ok(())
}

async fn serve(config: AppConfig) -> Result<()> {
    let service = Arc::new(connect_service(&config).await?);

    let scheduler = if config.scheduler_enabled {
        let registry = SourceRegistry::load(&config.registry_path()).await?;
        maybe_build_scheduler(&config, &registry, service.clone()).await?
    } else {
        None
    };
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started");
    }
    if config.admin_token.is_none() {
        warn!("LICMIRROR_ADMIN_TOKEN is not set; the admin API is unauthenticated");
    }

    let state = AppState::new(service, config.admin_token.clone());
    licmirror_web::serve(&config.bind_addr, state).await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}
