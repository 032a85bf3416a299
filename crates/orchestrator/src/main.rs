use anyhow::Result;
use axum::{extract::State, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use chat_client::{BotApi, Update, UpdatePoller};
use orchestrator::callbacks::CallbackRouter;
use orchestrator::chat::TopicFacade;
use orchestrator::config;
use orchestrator::database::Database;
use orchestrator::envsync::NullEnvSync;
use orchestrator::executor::TaskExecutor;
use orchestrator::flows::ConversationFlows;
use orchestrator::machines::MachineRegistry;
use orchestrator::session::SessionSupervisor;
use orchestrator::shell::{self, ShellGateway};
use orchestrator::state::SharedState;
use orchestrator::transport::{ChatTransport, SuppressedTransport};
use orchestrator::workspace::GhCliHost;

/// Task stale sweeper cadence (one process runs it; startup recovery
/// covers the rest).
const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(600);
/// Machine registry sweeper cadence.
const MACHINE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

struct AppState {
    db: Database,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (dev only, non-fatal in production)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    shell::init_ssh_key()?;

    let s = config::settings();
    let db = Database::new().await?;
    let shell = Arc::new(ShellGateway::from_settings()?);
    let state = Arc::new(SharedState::new());
    let registry = MachineRegistry::new(db.clone());
    let flows = Arc::new(ConversationFlows::new());

    let bot = Arc::new(BotApi::new(&s.bot_api_url, &s.bot_token)?);
    // Suppression wraps at the construction seam: every handle outside the
    // facade's stream path goes through the middleware
    let suppressed: Arc<dyn ChatTransport> = Arc::new(SuppressedTransport::new(
        Arc::clone(&bot),
        Arc::clone(&state.suppression),
    ));

    let facade = Arc::new(TopicFacade::new(
        Arc::clone(&bot) as Arc<dyn ChatTransport>,
        s.chat_group_id,
        db.clone(),
        Arc::clone(&state),
    ));
    let supervisor = Arc::new(SessionSupervisor::new(
        Arc::clone(&shell),
        Arc::clone(&facade),
        db.clone(),
        registry.clone(),
        Arc::clone(&state),
    ));

    let cancel_token = CancellationToken::new();
    let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    if s.env_sync_passphrase.is_some() {
        tracing::warn!(
            "env_sync_passphrase is set but no sync backend is linked into this build; \
             .env propagation is disabled"
        );
    }

    // Task executor (when this process is a worker)
    let executor = if s.executor_enabled {
        let executor = Arc::new(TaskExecutor::new(
            db.clone(),
            Arc::clone(&shell),
            Arc::clone(&facade),
            registry.clone(),
            Arc::clone(&supervisor),
            Arc::clone(&state),
            Arc::new(NullEnvSync),
            Arc::new(GhCliHost::new(Arc::clone(&shell), s.default_org.clone())),
            None,
        ));

        executor.register_machines().await;
        executor.recover_stale_tasks().await;
        executor.recover_orphaned_topics().await;

        background.push(tokio::spawn(
            Arc::clone(&executor).run(cancel_token.clone()),
        ));
        background.push(tokio::spawn(
            Arc::clone(&executor).heartbeat_loop(cancel_token.clone()),
        ));
        Some(executor)
    } else {
        None
    };

    let router = Arc::new(CallbackRouter::new(
        db.clone(),
        Arc::clone(&state),
        Arc::clone(&flows),
        Arc::clone(&facade),
        Arc::clone(&shell),
        registry.clone(),
        Arc::clone(&supervisor),
        Arc::clone(&suppressed),
        executor.clone(),
    ));

    // Update receiver with offset persistence and backoff
    let (update_tx, mut update_rx) = mpsc::channel::<Update>(100);
    let poller = UpdatePoller::new(
        BotApi::new(&s.bot_api_url, &s.bot_token)?,
        Some(PathBuf::from(&s.update_offset_path)),
    );
    let cancel_clone = cancel_token.clone();
    background.push(tokio::spawn(async move {
        if let Err(e) = poller.run(update_tx, cancel_clone).await {
            tracing::error!(error = %e, "Update poller exited");
        }
    }));

    // Update dispatch
    let router_clone = Arc::clone(&router);
    let cancel_clone = cancel_token.clone();
    background.push(tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                u = update_rx.recv() => match u {
                    Some(u) => u,
                    None => break,
                },
                _ = cancel_clone.cancelled() => break,
            };
            if let Some(message) = update.message {
                router_clone.handle_message(message).await;
            } else if let Some(callback) = update.callback_query {
                router_clone.handle_callback(callback).await;
            }
        }
        tracing::info!("Update dispatcher stopped");
    }));

    // Stale task sweeper
    let db_clone = db.clone();
    let registry_clone = registry.clone();
    let cancel_clone = cancel_token.clone();
    background.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(STALE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let machines = match registry_clone.all().await {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(error = %e, "Stale sweep could not list machines");
                            continue;
                        }
                    };
                    for machine in machines {
                        match db_clone.fail_stale_tasks(&machine.machine_id).await {
                            Ok(count) if count > 0 => {
                                tracing::warn!(
                                    machine = %machine.machine_id,
                                    count,
                                    "Stale sweeper failed orphaned tasks"
                                );
                            }
                            Err(e) => {
                                tracing::warn!(machine = %machine.machine_id, error = %e, "Stale sweep failed");
                            }
                            _ => {}
                        }
                    }
                }
                _ = cancel_clone.cancelled() => break,
            }
        }
    }));

    // Machine registry sweeper
    let registry_clone = registry.clone();
    let cancel_clone = cancel_token.clone();
    background.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(MACHINE_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = registry_clone.sweep_stale().await {
                        tracing::warn!(error = %e, "Machine sweep failed");
                    }
                }
                _ = cancel_clone.cancelled() => break,
            }
        }
    }));

    // Health and metrics listener
    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/metrics",
            get(move || {
                let handle = prometheus_handle.clone();
                async move { handle.render() }
            }),
        )
        .with_state(Arc::new(AppState { db: db.clone() }));

    let listener = tokio::net::TcpListener::bind(&s.listen_addr).await?;
    tracing::info!("Listening on {}", s.listen_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel_token.clone()))
        .await?;

    tracing::info!("Cancelling background tasks...");
    cancel_token.cancel();

    // Kill every live session so remote processes don't outlive us
    for session in state.active_sessions.iter() {
        if let Some(handle) = &session.handle {
            handle.kill();
        }
    }

    let shutdown_timeout = Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        for task in background {
            let _ = task.await;
        }
    })
    .await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Health probe: 503 when the store is unreachable.
async fn health_check(State(state): State<Arc<AppState>>) -> (axum::http::StatusCode, &'static str) {
    match state.db.health_check().await {
        Ok(()) => (axum::http::StatusCode::OK, "OK"),
        Err(_) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "Database unavailable",
        ),
    }
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel_token.cancelled() => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
