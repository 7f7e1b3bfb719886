use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultkeep_core::process::ProcessRunner;
use vaultkeep_core::secret::SecretBox;
use vaultkeep_db::repositories::RunRepo;
use vaultkeep_events::NotificationService;
use vaultkeep_pipeline::dumper::STALE_DUMP_AGE;
use vaultkeep_pipeline::executor::Collaborators;
use vaultkeep_pipeline::{
    sweep_stale_dumps, BorgArchiver, CliDatabaseDumper, PipelineExecutor, RcloneSyncer,
};
use vaultkeep_worker::{Scheduler, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultkeep_worker=debug,vaultkeep_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env().expect("Invalid worker configuration");

    std::fs::create_dir_all(&config.config_dir).expect("Failed to create config directory");
    let secrets = SecretBox::open_or_init(&config.secret_key, &config.salt_path())
        .expect("Failed to derive the secret key");

    let pool = vaultkeep_db::create_pool(&config.database_url)
        .await
        .expect("Failed to open job store");
    tracing::info!("Job store opened");

    vaultkeep_db::health_check(&pool)
        .await
        .expect("Job store health check failed");

    vaultkeep_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database migrations applied");

    // --- Startup sweeps ---
    let interrupted = RunRepo::mark_interrupted(&pool, Utc::now())
        .await
        .expect("Failed to close interrupted runs");
    if interrupted > 0 {
        tracing::warn!(interrupted, "Marked runs left running by a previous process as failed");
    }

    std::fs::create_dir_all(&config.dump_dir).expect("Failed to create dump directory");
    match sweep_stale_dumps(&config.dump_dir, STALE_DUMP_AGE) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "Removed stale dump directories"),
        Err(e) => tracing::warn!(error = %e, "Failed to sweep stale dumps"),
    }

    // --- Pipeline ---
    let runner = ProcessRunner::new(config.memory_sample_interval);
    let collaborators = Collaborators {
        archiver: Arc::new(BorgArchiver::new(runner.clone(), &config.tools.borg)),
        dumper: Arc::new(CliDatabaseDumper::new(
            runner.clone(),
            &config.dump_dir,
            &config.tools,
        )),
        syncer: Arc::new(RcloneSyncer::new(runner.clone(), &config.tools.rclone)),
        notifier: Arc::new(NotificationService::from_env()),
    };
    let executor = Arc::new(PipelineExecutor::new(
        pool.clone(),
        collaborators,
        runner,
        config.pipeline_settings(),
    ));

    // --- Scheduler ---
    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        secrets,
        executor,
        config.scheduler_settings(),
    ));
    let cancel = CancellationToken::new();
    let mut scheduler_handle = tokio::spawn({
        let scheduler = Arc::clone(&scheduler);
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    let stopped_early = tokio::select! {
        () = shutdown_signal() => None,
        result = &mut scheduler_handle => Some(result),
    };

    // --- Shutdown ---
    cancel.cancel();
    let scheduler_result = match stopped_early {
        Some(result) => {
            tracing::error!("Scheduler loop exited before shutdown was requested");
            result
        }
        None => scheduler_handle.await,
    };
    if let Err(e) = scheduler_result {
        tracing::error!(error = %e, "Scheduler task failed");
    }
    if scheduler.shutdown(config.shutdown_timeout).await {
        tracing::info!("All running backups finished");
    }

    pool.close().await;
    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
