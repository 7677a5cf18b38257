use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use reply_relay::bot::{BotIdentity, ChatRouter, Persona, PraisePolicy};
use reply_relay::channels::TelegramApi;
use reply_relay::config::{BotConfig, PipelineConfig};
use reply_relay::conversation::ConversationStore;
use reply_relay::keep_alive::KeepAlive;
use reply_relay::llm::ChatCompletionService;
use reply_relay::pipeline::{Pipeline, PipelineDeps, Queues};
use reply_relay::server::{self, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    let bot_config = BotConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  TG_TOKEN, HF_TOKEN and PUBLIC_URL must be set (or present in .env)");
        std::process::exit(1);
    });
    let pipeline_config = PipelineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let _log_guard = init_tracing(bot_config.log_dir.as_deref());

    eprintln!("🤖 Reply Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", bot_config.llm_model);
    eprintln!("   Webhook: {}/webhook/<token>", bot_config.public_url);
    eprintln!("   Listening: 0.0.0.0:{}", bot_config.port);
    eprintln!(
        "   Workers: {} dispatch, {} generation\n",
        pipeline_config.dispatch_workers, pipeline_config.generation_workers
    );

    // ── Collaborators ───────────────────────────────────────────────────
    let telegram = Arc::new(TelegramApi::new(bot_config.telegram_token.clone()));
    let identity = BotIdentity::from(
        telegram
            .get_me()
            .await
            .context("getMe failed; check TG_TOKEN")?,
    );
    tracing::info!(bot_id = identity.id, username = ?identity.username, "Bot identity loaded");

    let persona = Arc::new(Persona::load(&bot_config.persona_path).await?);
    let store = Arc::new(ConversationStore::new(pipeline_config.max_history));
    let queues = Queues::new(&pipeline_config);

    let router = Arc::new(ChatRouter::new(
        identity,
        bot_config.bot_names.clone(),
        Arc::clone(&store),
        queues.submitter(),
        telegram.clone(),
        PraisePolicy {
            base_chance: bot_config.base_chance,
            keyword_chance: bot_config.keyword_chance,
        },
    ));
    let generator = Arc::new(ChatCompletionService::from_config(
        &bot_config,
        persona,
        Arc::clone(&store),
    ));

    // ── Pipeline ────────────────────────────────────────────────────────
    let pipeline = Pipeline::new(
        pipeline_config.clone(),
        queues,
        PipelineDeps {
            router,
            generator,
            store,
            sink: telegram.clone(),
        },
    );
    pipeline.start().await?;

    let background = CancellationToken::new();
    if bot_config.keep_alive {
        KeepAlive::new(&bot_config.public_url, bot_config.keep_alive_interval)
            .spawn(background.clone());
    }

    // ── HTTP + webhook registration ─────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", bot_config.port))
        .await
        .with_context(|| format!("failed to bind port {}", bot_config.port))?;

    if let Err(e) = telegram.delete_webhook(true).await {
        tracing::warn!(error = %e, "Failed to delete previous webhook (ignored)");
    }
    let webhook_url = format!(
        "{}/webhook/{}",
        bot_config.public_url,
        bot_config.telegram_token.expose_secret()
    );
    telegram
        .set_webhook(&webhook_url)
        .await
        .context("setWebhook failed")?;
    tracing::info!(public_url = %bot_config.public_url, "Webhook registered");

    let app = server::routes(WebhookState {
        ingress: pipeline.ingress(),
        token: Arc::new(bot_config.telegram_token.clone()),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // ── Shutdown ────────────────────────────────────────────────────────
    tracing::info!("Shutting down: deleting webhook and stopping workers");
    background.cancel();
    if let Err(e) = telegram.delete_webhook(false).await {
        tracing::warn!(error = %e, "Failed to delete webhook on shutdown");
    }
    let report = pipeline.stop(pipeline_config.shutdown_grace).await;
    tracing::info!(
        finished = report.finished,
        aborted = report.aborted,
        discarded_inbound = report.discarded_inbound,
        discarded_generation = report.discarded_generation,
        "Shutdown complete"
    );
    Ok(())
}

/// Console logging, plus a daily rolling file under `log_dir` when set.
/// The returned guard must live until exit so buffered lines get flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "reply-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
