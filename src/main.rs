use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use doc_intake::api::{ApiState, api_routes};
use doc_intake::classify::{Classifier, ExtractionSchema, anthropic_vision};
use doc_intake::config::{AppConfig, SeedWorkflow};
use doc_intake::dispatch::{Dispatcher, RetrySweeper, spawn_retry_ticker};
use doc_intake::fetch::FileFetcher;
use doc_intake::hashing::ContentHasher;
use doc_intake::intake::IntakeService;
use doc_intake::store::{Database, LibSqlBackend};
use doc_intake::submission::tracker::SubmissionTracker;
use doc_intake::workflow::WorkflowEngine;
use doc_intake::workflow::model::TRIGGER_ATTACHMENT_RECEIVED;
use doc_intake::workflow::templates::utility_bill_template;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    // Held for the life of the process so buffered log lines are flushed.
    let _log_guard = init_tracing(&config);

    eprintln!("📄 Doc Intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.classifier.model);
    eprintln!("   API: http://0.0.0.0:{}/api", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("opening database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    if let Some(seed) = &config.seed_workflow {
        seed_workflow(&db, seed).await?;
    }

    // ── Pipeline ─────────────────────────────────────────────────────────
    let vision = anthropic_vision(&config.classifier)?;
    let classifier = Arc::new(Classifier::new(
        Arc::clone(&db),
        vision,
        ExtractionSchema::utility_documents(),
        config.classifier.clone(),
    ));
    let tracker = Arc::new(SubmissionTracker::new(Arc::clone(&db)));
    let dispatcher = Arc::new(Dispatcher::new(&config.dispatch, Arc::clone(&tracker))?);
    let engine = Arc::new(WorkflowEngine::new(
        Arc::clone(&db),
        Arc::clone(&classifier),
        Arc::clone(&dispatcher),
    ));
    let fetcher = FileFetcher::new(config.dispatch.request_timeout)?;
    let intake = Arc::new(IntakeService::new(
        Arc::clone(&db),
        ContentHasher::new(config.default_country_code.clone()),
        fetcher,
        classifier,
        engine,
    ));

    // ── Retry poller ─────────────────────────────────────────────────────
    let sweeper = Arc::new(RetrySweeper::new(Arc::clone(&dispatcher)));
    let _retry_handle = spawn_retry_ticker(sweeper, config.retry_poll_interval);
    eprintln!(
        "   Retries: polling every {}s, max {} attempts",
        config.retry_poll_interval.as_secs(),
        config.dispatch.default_max_retries
    );

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(ApiState {
        store: Arc::clone(&db),
        intake,
        tracker,
    });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    tracing::info!(port = config.port, "Doc intake server started");
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "doc-intake.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            eprintln!("   Logs: {}", dir.display());
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

/// Install the utility-bill workflow unless the tenant already has one.
async fn seed_workflow(db: &Arc<dyn Database>, seed: &SeedWorkflow) -> anyhow::Result<()> {
    let existing = db
        .list_active_workflows(&seed.tenant_id, TRIGGER_ATTACHMENT_RECEIVED)
        .await?;
    if !existing.is_empty() {
        eprintln!(
            "   Workflows: {} active for {}",
            existing.len(),
            seed.tenant_id
        );
        return Ok(());
    }

    let template = utility_bill_template(&seed.tenant_id, &seed.partner_base_url);
    db.install_workflow(&template).await?;
    eprintln!(
        "   Workflows: installed utility bill routing for {} -> {}",
        seed.tenant_id, seed.partner_base_url
    );
    Ok(())
}
