mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chatvault_client::{ClientError, HttpTransport, RateLimiter, RetryClient, RetryPolicy, SlackApi};
use chatvault_db::Database;
use chatvault_files::{Downloader, FilePipeline, Storage};
use chatvault_sync::{Orchestrator, RunOptions, RunReport};
use chatvault_types::{SyncLogger, TracingLogger};

use crate::config::Config;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chatvault=info,chatvault_sync=info,chatvault_files=info,chatvault_client=info,chatvault_db=info".into()
            }),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(report) => {
            summarize(&report);
            ExitCode::SUCCESS
        }
        Err(e) if is_auth_failure(&e) => {
            error!("Backup aborted, the token was refused: {:#}", e);
            ExitCode::from(3)
        }
        Err(e) => {
            error!("Backup failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<RunReport> {
    if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let db = Arc::new(Database::open(&config.db_path)?);
    let storage = Arc::new(Storage::new(config.storage_dir.clone()).await?);
    info!(
        "Database at {}, storage at {}",
        config.db_path.display(),
        config.storage_dir.display()
    );

    let cancel = CancellationToken::new();
    let logger: Arc<dyn SyncLogger> = Arc::new(TracingLogger);
    let policy = RetryPolicy {
        max_attempts: config.max_attempts,
        base_delay: config.backoff_base,
        ..Default::default()
    };

    let transport = HttpTransport::new(config.token.clone(), config.http_timeout)?;
    let limiter = Arc::new(RateLimiter::per_minute(config.rate_per_minute));
    let client = RetryClient::new(transport, limiter, policy.clone(), cancel.clone(), logger.clone());
    let api = Arc::new(SlackApi::new(client, config.api_base.clone(), config.page_size));

    // downloads share the API's limiter, token and cancellation
    let downloader = Downloader::new(api.clone(), policy, cancel.clone(), logger.clone());
    let files = Arc::new(FilePipeline::new(
        db.clone(),
        storage.clone(),
        downloader,
        config.max_file_bytes,
        logger.clone(),
    ));

    let options = RunOptions {
        full_resync: config.full_resync,
        skip_files: config.skip_files,
    };
    if options.full_resync {
        info!("Full resync requested, ignoring stored watermarks");
    }

    let orchestrator = Orchestrator::new(api, db, storage, files, options, cancel.clone(), logger);

    tokio::spawn(cancel_on_shutdown(cancel.clone()));
    if let Some(limit) = config.run_timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if !cancel.is_cancelled() {
                warn!("Run timeout of {:?} reached, cancelling", limit);
                cancel.cancel();
            }
        });
    }

    let report = orchestrator.run(&config.channels).await;
    cancel.cancel();
    report
}

fn summarize(report: &RunReport) {
    for channel in &report.channels {
        let files = channel.files();
        match &channel.error {
            None => info!(
                "#{} ({}): {} new, {} updated, {} failed messages; files {} acquired, {} linked, {} present, {} skipped, {} failed in {:.1}s",
                channel.name,
                channel.channel_id,
                channel.stats.new_messages,
                channel.stats.updated_messages,
                channel.stats.failed_messages,
                files.acquired,
                files.linked,
                files.present,
                files.skipped,
                files.failed,
                channel.duration.as_secs_f64()
            ),
            Some(e) => warn!("#{} ({}) failed: {}", channel.name, channel.channel_id, e),
        }
    }
    if let Some(sweep) = &report.sweep {
        info!(
            "Orphan sweep: {} reclaimed, {} kept for shared paths, {} dirs removed, {} failed",
            sweep.reclaimed, sweep.shared_kept, sweep.dirs_removed, sweep.failed
        );
    }
    info!(
        "Backup finished: {} channels ok, {} failed, {} new messages",
        report.channels_ok(),
        report.channels_failed(),
        report.new_messages()
    );
}

/// Cancel the run token on Ctrl+C or SIGTERM.
async fn cancel_on_shutdown(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = ctrl_c => info!("Received Ctrl+C, finishing current step..."),
                _ = sigterm.recv() => info!("Received SIGTERM, finishing current step..."),
                _ = cancel.cancelled() => return,
            },
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, finishing current step..."),
                    _ = cancel.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, finishing current step..."),
            _ = cancel.cancelled() => return,
        }
    }
    cancel.cancel();
}

fn is_auth_failure(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| cause.downcast_ref::<ClientError>().is_some_and(ClientError::is_auth))
}
