//! Fileflow binary: wire configuration, storage, database, and
//! notifications together and run the dispatcher.

mod cli;

use clap::Parser;
use cli::{Cli, Command};
use comfy_table::Table;
use fileflow_db::DbError;
use fileflow_logging::LogOptions;
use fileflow_notify::{Notifications, SmtpMailer, WebhookClient};
use fileflow_pipeline::{discover, CancellationToken, Dispatcher, PipelineContext, RetryPolicy};
use fileflow_protocol::{AppConfig, SourceRegistry, StoreUri};
use fileflow_readers::ReaderRegistry;
use fileflow_store::{FileStore, LocalFileStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const EXIT_INTERNAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = fileflow_logging::init(LogOptions {
        app_name: "fileflow",
        verbose: cli.verbose,
    }) {
        eprintln!("fileflow: failed to initialise logging: {:#}", e);
        return ExitCode::from(EXIT_INTERNAL);
    }

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fileflow: configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let registry = match SourceRegistry::load(&config.sources_path) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("fileflow: configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match cli.command {
        Command::Sources => {
            print_sources(&registry);
            ExitCode::SUCCESS
        }
        Command::Run {
            file,
            directory,
            source,
        } => run(config, registry, file, directory, source).await,
    }
}

async fn run(
    mut config: AppConfig,
    registry: SourceRegistry,
    file: Option<PathBuf>,
    directory: Option<PathBuf>,
    source_filter: Option<String>,
) -> ExitCode {
    let registry = match source_filter {
        Some(name) => match registry.restrict_to(&name) {
            Ok(registry) => registry,
            Err(e) => {
                eprintln!("fileflow: configuration error: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => registry,
    };
    if let Some(dir) = directory {
        match StoreUri::parse(&dir.display().to_string()) {
            Ok(uri) => config.drop_dir = uri,
            Err(e) => {
                eprintln!("fileflow: configuration error: {}", e);
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    let db = match fileflow_db::connect(&config.database_url, config.worker_count as u32 + 2).await
    {
        Ok(db) => db,
        Err(DbError::Unsupported(scheme)) => {
            eprintln!(
                "fileflow: configuration error: no driver built in for '{}'",
                scheme
            );
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            error!(error = %e, "database unavailable");
            return ExitCode::from(EXIT_INTERNAL);
        }
    };
    if let Err(e) = db.ensure_control_tables().await {
        error!(error = %e, "failed to ensure control tables");
        return ExitCode::from(EXIT_INTERNAL);
    }

    let mailer = match config.smtp.as_ref().map(SmtpMailer::new).transpose() {
        Ok(mailer) => mailer,
        Err(e) => {
            eprintln!("fileflow: configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let webhook = match config
        .webhook_url
        .as_deref()
        .map(WebhookClient::new)
        .transpose()
    {
        Ok(webhook) => webhook,
        Err(e) => {
            eprintln!("fileflow: configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; cancelling after current stage");
                cancel.cancel();
            }
        });
    }

    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new());
    let drop_dir = config.drop_dir.path.clone();
    let retry = RetryPolicy::new(config.retry_attempts);
    let ctx = Arc::new(PipelineContext {
        config,
        store: Arc::clone(&store),
        db,
        notifier: Arc::new(Notifications::new(mailer, webhook)),
        readers: Arc::new(ReaderRegistry::standard()),
        retry,
        cancel,
    });

    let jobs = match file {
        Some(path) => {
            let path = path.canonicalize().unwrap_or(path);
            match discover::single(Arc::clone(&store), &path).await {
                Ok(Some(job)) => vec![job],
                Ok(None) => {
                    eprintln!("fileflow: configuration error: no such file: {}", path.display());
                    return ExitCode::from(EXIT_CONFIG);
                }
                Err(e) => {
                    error!(error = %e, "cannot stat file");
                    return ExitCode::from(EXIT_INTERNAL);
                }
            }
        }
        None => match discover::snapshot(Arc::clone(&store), &drop_dir).await {
            Ok(jobs) => jobs,
            Err(e) => {
                // ListingFailed is fatal for the whole run.
                error!(error = %e, dir = %drop_dir.display(), "listing failed");
                return ExitCode::from(EXIT_INTERNAL);
            }
        },
    };

    let summary = Dispatcher::new(ctx, Arc::new(registry)).run(jobs).await;
    info!(
        discovered = summary.files_discovered,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        unmatched = summary.unmatched,
        internal_errors = summary.internal_errors,
        "fileflow run finished"
    );
    ExitCode::from(summary.exit_code() as u8)
}

fn print_sources(registry: &SourceRegistry) {
    let mut table = Table::new();
    table.set_header(["name", "pattern", "format", "target", "grain", "threshold"]);
    for source in &registry.sources {
        table.add_row([
            source.name.clone(),
            source.pattern.clone(),
            source.format.to_string(),
            source.target_table.clone(),
            source.grain.join(", "),
            source.error_threshold.to_string(),
        ]);
    }
    println!("{table}");
}
