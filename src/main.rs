use std::sync::Arc;

use anyhow::{Context, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_ops::config::AppConfig;
use inbox_ops::gateways::{
    ClassificationGateway, GraphConfig, GraphMailGateway, LogNotificationSink, MailGateway,
    NotificationSink, WebhookNotificationSink,
};
use inbox_ops::llm::classifier::LlmClassifier;
use inbox_ops::llm::{LlmConfig, create_completer};
use inbox_ops::pipeline::PipelineDeps;
use inbox_ops::runtime::{Runtime, Seed};
use inbox_ops::scheduler::RetryPolicy;
use inbox_ops::store::{Database, LibSqlBackend};
use inbox_ops::webhook::{WebhookState, webhook_routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    // ── Tracing ──────────────────────────────────────────────────────────
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-ops.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📬 Inbox Ops v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Webhook: http://0.0.0.0:{}/webhooks/mail", config.http_port);
    match &config.subscriptions.notification_url {
        Some(url) => eprintln!("   Push notifications: {url}"),
        None => eprintln!("   Push notifications: disabled (pull sync only)"),
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("failed to open database at {}", config.db_path.display()))?,
    );

    if let Some(path) = &config.seed_file {
        let seed = Seed::load(path)
            .await
            .with_context(|| format!("failed to load seed file {}", path.display()))?;
        seed.apply(db.as_ref()).await?;
        eprintln!(
            "   Seeded {} mailbox(es), {} rule(s)",
            seed.mailboxes.len(),
            seed.rules.len()
        );
    }

    // ── Gateways ─────────────────────────────────────────────────────────
    let Some(graph_config) = GraphConfig::from_env()? else {
        bail!("GRAPH_TENANT_ID not set; a mail provider is required");
    };
    let mail: Arc<dyn MailGateway> = Arc::new(GraphMailGateway::new(graph_config)?);

    let Some(llm_config) = LlmConfig::from_env()? else {
        bail!("no LLM API key set (ANTHROPIC_API_KEY or OPENAI_API_KEY)");
    };
    eprintln!("   Model: {}", llm_config.model);
    let completer = create_completer(&llm_config)?;
    let classifier: Arc<dyn ClassificationGateway> = Arc::new(LlmClassifier::new(completer));

    let notifier: Arc<dyn NotificationSink> = match &config.alert_webhook_url {
        Some(url) => Arc::new(WebhookNotificationSink::new(url, reqwest::Client::new())),
        None => Arc::new(LogNotificationSink),
    };

    // ── Runtime ──────────────────────────────────────────────────────────
    let deps = PipelineDeps::new(
        Arc::clone(&db),
        mail,
        classifier,
        notifier,
        config.pipeline.clone(),
    );
    let runtime = Arc::new(Runtime::new(
        deps,
        config.subscriptions.clone(),
        RetryPolicy::new(config.scheduler.retry_delays.clone()),
    ));
    let tasks = runtime.start(&config.scheduler)?;
    eprintln!("   Background tasks: {}\n", tasks.names().join(", "));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = webhook_routes(WebhookState::new(Arc::clone(&db)));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "Webhook server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("webhook server error")?;

    tracing::info!("Shutting down background tasks");
    tasks.shutdown().await;
    Ok(())
}
