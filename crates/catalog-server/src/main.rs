//! Catalog Server - Main entry point

use anyhow::{Context, Result};
use catalog_common::logging::{init_logging, LogConfig};
use catalog_common::JobStatus;
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::signal;
use tracing::info;
use uuid::Uuid;

use catalog_server::{
    config::{Config, QueueBackend},
    db, features,
    import::{
        lease::LeaseReaper,
        notifier::{LifecycleNotifier, WebhookDispatcher, WebhookNotifier},
        progress::{BroadcastChannel, PgNotifyChannel, ProgressChannel},
        queue::{setup_apalis, ApalisQueue, ImportWorker, LocalQueue, TaskQueue},
        source::{SourceLocator, StagedSources},
        store::{JobStore, PgJobStore},
        upsert::PgCatalogStore,
        ImportContext, ImportOutcome, ImportRunner, ImportTask, NewJob,
    },
    storage::Storage,
};

#[derive(Parser, Debug)]
#[command(name = "catalog-server")]
#[command(author, version, about = "Bulk product catalog import service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve,

    /// Run import workers against the durable queue
    Worker,

    /// Import one CSV file in the foreground
    Import {
        /// Path to the CSV file
        file: PathBuf,

        /// Import the file in place; it is deleted once the import finishes
        #[arg(long)]
        in_place: bool,
    },
}

/// Collaborators shared by every subcommand
struct Services {
    pool: PgPool,
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn LifecycleNotifier>,
    storage: Option<Storage>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // LOG_* variables override these
    let log_config = LogConfig::builder()
        .log_file_prefix("catalog-server")
        .filter_directives("catalog_server=debug,tower_http=debug,sqlx=warn,apalis=info")
        .build()
        .with_env()?;
    let _log_guard = init_logging(&log_config)?;

    let config = Config::load()?;
    let services = connect(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, services).await,
        Command::Worker => worker(config, services).await,
        Command::Import { file, in_place } => import_file(config, services, file, in_place).await,
    }
}

async fn connect(config: &Config) -> Result<Services> {
    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let storage = match &config.storage {
        Some(storage_config) => Some(Storage::new(storage_config.clone()).await?),
        None => {
            info!("S3_BUCKET not set, presigned uploads disabled");
            None
        },
    };

    let dispatcher = WebhookDispatcher::new(&config.webhooks)?;
    let notifier: Arc<dyn LifecycleNotifier> =
        Arc::new(WebhookNotifier::new(pool.clone(), dispatcher));

    Ok(Services {
        jobs: Arc::new(PgJobStore::new(pool.clone())),
        pool,
        notifier,
        storage,
    })
}

fn runner(
    config: &Config,
    services: &Services,
    channel: Arc<dyn ProgressChannel>,
) -> Arc<ImportRunner> {
    let ctx = ImportContext {
        jobs: services.jobs.clone(),
        catalog: Arc::new(PgCatalogStore::new(services.pool.clone())),
        sources: Arc::new(StagedSources::new(services.storage.clone())),
        channel,
        notifier: services.notifier.clone(),
    };
    Arc::new(ImportRunner::new(ctx, &config.import))
}

fn lease_reaper(config: &Config, services: &Services, runner: &ImportRunner) -> LeaseReaper {
    LeaseReaper::new(
        services.jobs.clone(),
        runner.reporter().clone(),
        services.notifier.clone(),
        config.import.lease_timeout(),
        config.import.heartbeat_interval(),
    )
}

async fn serve(config: Config, services: Services) -> Result<()> {
    info!(
        "Starting catalog server on {}:{} ({:?} queue)",
        config.server.host, config.server.port, config.import.queue
    );
    tokio::fs::create_dir_all(&config.import.upload_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.import.upload_dir.display()))?;

    let (channel, queue, reaper): (Arc<dyn ProgressChannel>, Arc<dyn TaskQueue>, _) =
        match config.import.queue {
            QueueBackend::Local => {
                let channel: Arc<dyn ProgressChannel> = Arc::new(BroadcastChannel::new());
                let runner = runner(&config, &services, channel.clone());
                let reaper = lease_reaper(&config, &services, &runner).spawn();
                let queue: Arc<dyn TaskQueue> =
                    Arc::new(LocalQueue::new(runner, config.import.worker_concurrency));
                (channel, queue, Some(reaper))
            },
            QueueBackend::Apalis => {
                setup_apalis(&services.pool).await?;
                let channel: Arc<dyn ProgressChannel> =
                    Arc::new(PgNotifyChannel::new(services.pool.clone()));
                let queue: Arc<dyn TaskQueue> = Arc::new(ApalisQueue::new(&services.pool));
                (channel, queue, None)
            },
        };

    let state = features::FeatureState {
        db: services.pool.clone(),
        jobs: services.jobs.clone(),
        channel,
        queue,
        notifier: services.notifier.clone(),
        storage: services.storage.clone(),
        import: Arc::new(config.import.clone()),
    };
    let app = features::app(state, &config.cors);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    info!("Server shut down gracefully");

    Ok(())
}

async fn worker(config: Config, services: Services) -> Result<()> {
    if config.import.queue != QueueBackend::Apalis {
        anyhow::bail!("The worker subcommand requires IMPORT_QUEUE=apalis");
    }
    setup_apalis(&services.pool).await?;

    let channel: Arc<dyn ProgressChannel> = Arc::new(PgNotifyChannel::new(services.pool.clone()));
    let runner = runner(&config, &services, channel);
    let reaper = lease_reaper(&config, &services, &runner).spawn();
    let workers = ImportWorker::new(
        services.pool.clone(),
        runner,
        config.import.worker_concurrency,
    )
    .start();

    shutdown_signal(config.server.shutdown_timeout_secs).await;

    workers.abort();
    reaper.abort();
    info!("Workers shut down");

    Ok(())
}

async fn import_file(
    config: Config,
    services: Services,
    file: PathBuf,
    in_place: bool,
) -> Result<()> {
    let filename = file
        .file_name()
        .and_then(|name| name.to_str())
        .context("Import path has no file name")?
        .to_string();

    let job_id = Uuid::new_v4();
    let path = if in_place {
        file
    } else {
        let copy = config.import.upload_dir.join(format!("{}.csv", job_id));
        tokio::fs::create_dir_all(&config.import.upload_dir).await?;
        tokio::fs::copy(&file, &copy)
            .await
            .with_context(|| format!("Failed to stage {}", file.display()))?;
        copy
    };

    let source = SourceLocator::Local { path };
    services
        .jobs
        .create(NewJob::new(job_id, filename, JobStatus::Uploaded).with_source(source.clone()))
        .await?;

    // Progress goes to NOTIFY so a running server can stream it
    let channel: Arc<dyn ProgressChannel> = Arc::new(PgNotifyChannel::new(services.pool.clone()));
    let runner = runner(&config, &services, channel);

    match runner.run(&ImportTask::new(job_id, source)).await? {
        ImportOutcome::Completed(summary) => {
            println!(
                "Imported {} rows from {} ({} created, {} updated, {} batches)",
                summary.processed,
                summary.total_rows,
                summary.created,
                summary.updated,
                summary.batches
            );
            println!("Job: {}", summary.job_id);
        },
        ImportOutcome::Skipped { status } => {
            println!("Job {} was not imported (status: {})", job_id, status);
        },
    }

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}
