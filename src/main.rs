use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio::sync::broadcast;

use herald::alerts::LogAlerts;
use herald::backends::{BackendRegistry, LogMailer};
use herald::config::{OtelConfig, Settings};
use herald::dispatch::Dispatcher;
use herald::engine::DrainEngine;
use herald::render::TemplateRenderer;
use herald::store::create_store;
use herald::tasks::{ChannelDrainScheduler, DrainListener, DrainTask, SweepTask};
use herald::telemetry::init_telemetry;
use herald::users::{DirectoryLocales, PassthroughDirectory, UserDirectory};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; keep the guard alive for the process lifetime
    let _telemetry = init_telemetry(&OtelConfig::from_env())?;

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    let store = create_store(&settings.store, &settings.database).await?;

    // Active backends per configuration
    let registry = BackendRegistry::builtin(Arc::new(LogMailer));
    let backends = registry.load_all(&settings.notification.backends)?;
    tracing::info!(backends = backends.len(), "Backends activated");

    // The standalone worker has no host account system; ids pass through
    // as usernames. Embedding hosts wire their own directory instead.
    let directory: Arc<dyn UserDirectory> = Arc::new(PassthroughDirectory);

    let (scheduler, drain_rx) = ChannelDrainScheduler::new(1024);
    let dispatcher = Arc::new(
        Dispatcher::new(
            store.clone(),
            backends,
            Arc::new(TemplateRenderer::with_defaults()),
            settings.site.clone(),
            &settings.notification,
        )
        .with_locales(Arc::new(DirectoryLocales::new(directory.clone())))
        .with_scheduler(Arc::new(scheduler)),
    );

    let engine = Arc::new(DrainEngine::new(
        store.clone(),
        dispatcher.clone(),
        directory,
        Arc::new(LogAlerts),
        settings.site.clone(),
        &settings.notification,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    // Start background tasks
    let listener = DrainListener::new(engine.clone(), drain_rx, shutdown_tx.subscribe());
    let listener_handle = tokio::spawn(listener.run());

    let drain_task = DrainTask::new(
        settings.notification.clone(),
        engine.clone(),
        shutdown_tx.subscribe(),
    );
    let drain_handle = tokio::spawn(drain_task.run());

    let sweep_task = SweepTask::new(
        settings.notification.clone(),
        store.clone(),
        shutdown_tx.subscribe(),
    );
    let sweep_handle = tokio::spawn(sweep_task.run());

    tracing::info!(site = %settings.site.name, "Notice worker started");

    // Block until a shutdown signal arrives, then fan it out
    shutdown_signal_handler(shutdown_tx).await;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(listener_handle, drain_handle, sweep_handle);

    // One final pass so a clean shutdown leaves no drained work behind
    engine.send_all().await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    let _ = shutdown_tx.send(());
}
