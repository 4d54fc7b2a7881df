use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use slotbook::config::Config;
use slotbook::engine::Engine;
use slotbook::notify::NotifyHub;
use slotbook::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use slotbook::reaper;
use slotbook::rooms::InMemoryRooms;
use slotbook::service::BookingService;
use slotbook::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    slotbook::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let wal_path = config.data_dir.join("slotbook.wal");
    let engine = Arc::new(Engine::open(
        wal_path,
        Arc::new(NotifyHub::new()),
        Arc::new(InMemoryRooms::new()),
        config.policy.clone(),
    )?);

    tokio::spawn(reaper::run_compactor(engine.clone(), config.compact_threshold));
    if config.sweeper.enabled {
        tokio::spawn(reaper::run_sweeper(engine.clone(), config.sweeper.clone()));
    }

    let service = Arc::new(BookingService::new(engine));
    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(
        data_dir = %config.data_dir.display(),
        max_connections,
        utc_offset = %config.policy.utc_offset,
        sweeper = config.sweeper.enabled,
        metrics_port = ?config.metrics_port,
        "slotbook listening on {addr}"
    );

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = &mut shutdown => {
                info!("shutdown requested, no longer accepting connections");
                break;
            }
        };
        let (socket, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            warn!("at {max_connections} connections, turning away {peer}");
            metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            continue;
        };

        debug!("client {peer} connected");
        metrics::counter!(CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = wire::process_connection(socket, service).await {
                warn!("client {peer}: {e}");
            }
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
            drop(permit);
        });
    }

    drain(&semaphore, max_connections, Duration::from_secs(10)).await;
    info!("slotbook stopped");
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Wait until every connection permit is back, or give up at `deadline`.
async fn drain(semaphore: &Semaphore, max_connections: usize, deadline: Duration) {
    let started = Instant::now();
    loop {
        let open = max_connections - semaphore.available_permits();
        if open == 0 {
            info!("all connections closed");
            return;
        }
        if started.elapsed() >= deadline {
            warn!("gave up draining with {open} connections open");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
