use anyhow::Result;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use mirror_sync::controller::delete::Deleter;
use mirror_sync::controller::extract::{ExtractProcess, ExtractSettings};
use mirror_sync::controller::scanner::{ScanManager, ScannerProcess};
use mirror_sync::controller::scanners::{ActiveFiles, ActiveScanner, LocalScanner, RemoteScanner};
use mirror_sync::controller::ssh::RemoteEndpoint;
use mirror_sync::controller::transfer::{RsyncSettings, RsyncTransfer};
use mirror_sync::controller::{
    Collaborators, Controller, ControllerError, ControllerHandle, ControllerOptions, ControllerPersist,
    Status,
};
use mirror_sync::model::ModelEvent;
use mirror_sync::storage::Storage;
use mirror_sync::utils::config::Config;
use mirror_sync::utils::{self, EventQueue};

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    let config = utils::config::load_config()?;

    info!("Starting mirror-sync v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Mirroring {}:{} into {}",
        config.remote_login(),
        config.remote_path,
        config.local_path.display()
    );
    info!(
        "Tick every {}, remote scan every {}, local scan every {}",
        humantime::format_duration(Duration::from_millis(config.tick_interval_ms)),
        humantime::format_duration(Duration::from_millis(config.interval_ms_remote_scan)),
        humantime::format_duration(Duration::from_millis(config.interval_ms_local_scan)),
    );

    // Initialize storage layer
    let storage = Storage::new(&config.database_url).await?;
    storage.run_migrations().await?;

    let persist = match storage.load_persist(config.max_tracked_files).await? {
        Some(persist) => persist,
        None => {
            info!("No saved state found, starting fresh");
            ControllerPersist::new(config.max_tracked_files)
        }
    };

    let controller = Controller::new(
        start_collaborators(&config)?,
        persist,
        Arc::new(Status::new()),
        ControllerOptions {
            cache_ttl: Duration::from_secs(config.model_cache_ttl_secs),
            memory_log_interval: Duration::from_secs(config.memory_log_interval_secs),
        },
    );
    let handle = controller.handle();

    let events = Arc::new(EventQueue::<ModelEvent>::new(config.event_queue_size));
    let initial = handle.files_and_add_listener(events.clone());
    info!("Model starts with {} file(s)", initial.len());
    let event_log = tokio::spawn(log_model_events(events));

    let (stop_tx, stop_rx) = bounded::<()>(1);
    let tick = Duration::from_millis(config.tick_interval_ms);
    let mut controller_task = tokio::task::spawn_blocking(move || run_controller(controller, stop_rx, tick));

    let mut persist_timer = tokio::time::interval(Duration::from_secs(config.persist_interval_secs));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => {
                drop(stop_tx);
                break (&mut controller_task).await;
            }
            joined = &mut controller_task => break joined,
            _ = persist_timer.tick() => save_persist(&storage, &handle).await,
        }
    };

    event_log.abort();
    save_persist(&storage, &handle).await;

    match outcome {
        Ok(Ok(())) => {
            info!("Stopped gracefully");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Controller stopped: {}", e);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn start_collaborators(config: &Config) -> Result<Collaborators> {
    let endpoint = RemoteEndpoint::from_config(config);
    let active_files = ActiveFiles::default();

    let remote = ScannerProcess::start(
        "remote",
        Box::new(RemoteScanner::new(endpoint.clone())),
        Duration::from_millis(config.interval_ms_remote_scan),
    )?;
    let local = ScannerProcess::start(
        "local",
        Box::new(LocalScanner::new(config.local_path.clone())),
        Duration::from_millis(config.interval_ms_local_scan),
    )?;
    let active = ScannerProcess::start(
        "active",
        Box::new(ActiveScanner::new(config.local_path.clone(), active_files.clone())),
        Duration::from_millis(config.interval_ms_downloading_scan),
    )?;

    let transfer = RsyncTransfer::new(RsyncSettings {
        endpoint: endpoint.clone(),
        local_path: config.local_path.clone(),
        max_parallel: config.num_max_parallel_downloads,
    });
    let extractor = ExtractProcess::start(ExtractSettings {
        local_path: config.local_path.clone(),
        out_dir: config.extract_out_dir(),
        command: config.extract_command.clone(),
    })?;

    Ok(Collaborators {
        scans: Box::new(ScanManager::new(remote, local, active, active_files)),
        transfer: Box::new(transfer),
        extractor: Box::new(extractor),
        deleter: Box::new(Deleter::new(config.local_path.clone(), endpoint)),
    })
}

/// The reconciliation thread: tick until told to stop or a fatal error.
fn run_controller(
    mut controller: Controller,
    stop_rx: Receiver<()>,
    tick: Duration,
) -> std::result::Result<(), ControllerError> {
    info!("Controller started");
    let result = loop {
        match controller.process() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => break Err(e),
            Err(e) => warn!("Tick failed: {}", e),
        }
        match stop_rx.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };
    controller.exit();
    result
}

async fn save_persist(storage: &Storage, handle: &ControllerHandle) {
    let persist = handle.persist_snapshot();
    if let Err(e) = storage.save_persist(&persist).await {
        error!("Failed to save state: {:#}", e);
    }
}

async fn log_model_events(events: Arc<EventQueue<ModelEvent>>) {
    let mut timer = tokio::time::interval(Duration::from_secs(1));
    loop {
        timer.tick().await;
        while let Some(event) = events.next_event() {
            match &event {
                ModelEvent::Added(file) => debug!("Added {} ({})", file.name(), file.state),
                ModelEvent::Removed(file) => debug!("Removed {}", file.name()),
                ModelEvent::Updated { old, new } if old.state != new.state => {
                    info!("{}: {} -> {}", new.name(), old.state, new.state)
                }
                ModelEvent::Updated { .. } => {}
            }
        }
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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

    info!("Shutdown signal received");
}
