use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use turno_core::SyncMode;
use turno_storage::{LedgerStore, MemoryStore, OrderStore, PgStore, TaskRepository};
use turno_sync::{
    maybe_build_scheduler, BackfillOrchestrator, BackfillRequest, Clock, SyncConfig,
    SyncReconciler, SystemClock,
};
use turno_web::AppState;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "turno-cli")]
#[command(about = "Turnover cleaning sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the cleaning tasks of one order.
    SyncOrder { order_id: Uuid },
    /// Re-sync every order overlapping a date window.
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Run the web trigger surface (and the cron scheduler if enabled).
    Serve,
    /// Apply pending database migrations.
    Migrate,
}

struct Engine {
    orders: Arc<dyn OrderStore>,
    reconciler: Arc<SyncReconciler>,
    ledger: Arc<dyn LedgerStore>,
}

async fn build_engine(config: &SyncConfig, clock: Arc<dyn Clock>) -> Result<Engine> {
    let (orders, tasks, ledger): (
        Arc<dyn OrderStore>,
        Arc<dyn TaskRepository>,
        Arc<dyn LedgerStore>,
    ) = match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PgStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?,
            );
            (store.clone(), store.clone(), store)
        }
        None => {
            info!("DATABASE_URL not set; using in-memory store");
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store.clone(), store)
        }
    };
    let reconciler = Arc::new(SyncReconciler::new(
        orders.clone(),
        tasks,
        ledger.clone(),
        clock,
    ));
    Ok(Engine {
        orders,
        reconciler,
        ledger,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::SyncOrder { order_id } => {
            let engine = build_engine(&config, clock).await?;
            let report = engine.reconciler.sync_order(order_id, SyncMode::Realtime).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Backfill {
            from,
            to,
            concurrency,
        } => {
            let engine = build_engine(&config, clock).await?;
            let orchestrator = BackfillOrchestrator::new(
                engine.orders.clone(),
                engine.reconciler.clone(),
                config.backfill_concurrency,
            );
            let report = orchestrator
                .run(BackfillRequest {
                    date_from: from,
                    date_to: to,
                    concurrency,
                })
                .await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            let engine = build_engine(&config, clock.clone()).await?;
            let orchestrator = Arc::new(BackfillOrchestrator::new(
                engine.orders.clone(),
                engine.reconciler.clone(),
                config.backfill_concurrency,
            ));
            if let Some(mut sched) =
                maybe_build_scheduler(&config, orchestrator.clone(), clock).await?
            {
                sched.start().await.context("starting scheduler")?;
                info!("backfill scheduler started");
            }
            let state = AppState {
                reconciler: engine.reconciler,
                backfill: orchestrator,
                ledger: engine.ledger,
            };
            turno_web::serve(state, config.web_port).await?;
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
