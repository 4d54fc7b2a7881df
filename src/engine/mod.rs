mod catalog;
mod checks;
mod clock;
mod error;
mod queries;
mod reserve;
mod resolver;
mod reviews;
mod snapshot;
mod store;
mod transitions;

pub use catalog::{MaterializeRequest, NewPattern, NewWindow};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, WindowConstraint};
pub use reserve::ReserveRequest;
pub use resolver::resolve;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::config::BookingPolicy;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, NotifyHub};
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::rooms::RoomDirectory;
use crate::wal::Wal;

use snapshot::Snapshot;
use store::InMemoryStore;

// ── Group-commit WAL channel ─────────────────────────────────────

type AppendResponse = oneshot::Sender<io::Result<()>>;

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: AppendResponse,
    },
    /// Rewrite the log from the writer's own snapshot. Responds with the
    /// number of records written.
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL file plus the folded image of everything it has durably
/// written, so compaction never has to read live rows.
struct WalWriter {
    wal: Wal,
    snapshot: Snapshot,
}

/// Background task that batches appends for group commit: block for the
/// first append, drain whatever else is already queued, write the batch with
/// one fsync, then answer every sender.
async fn wal_writer_loop(mut writer: WalWriter, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                writer.commit_batch(batch);
                if let Some(cmd) = deferred {
                    writer.handle(cmd);
                }
            }
            other => writer.handle(other),
        }
    }
    info!("WAL writer for {} stopped", writer.wal.path().display());
}

impl WalWriter {
    fn commit_batch(&mut self, batch: Vec<(Event, AppendResponse)>) {
        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = Instant::now();
        let result = self.write_batch(&batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        if result.is_ok() {
            for (event, _) in &batch {
                self.snapshot.fold(event);
            }
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }
    }

    fn write_batch(&mut self, batch: &[(Event, AppendResponse)]) -> io::Result<()> {
        let result = batch
            .iter()
            .try_for_each(|(event, _)| self.wal.append_buffered(event))
            .and_then(|()| self.wal.flush_sync());
        if let Err(e) = &result {
            // Every caller in the batch is told it failed, so none of it may replay.
            if let Err(discard) = self.wal.discard_pending() {
                tracing::error!(
                    "WAL {}: batch failed ({e}) and could not be rolled back: {discard}",
                    self.wal.path().display()
                );
            }
        }
        result
    }

    fn handle(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::Append { event, response } => self.commit_batch(vec![(event, response)]),
            WalCommand::Compact { response } => {
                let events = self.snapshot.to_events();
                let result = self.wal.compact(&events).map(|()| events.len());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────

/// The reservation engine: catalog, reservation and lifecycle operations
/// over an in-memory store persisted through a group-commit WAL.
pub struct Engine {
    pub(crate) store: InMemoryStore,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    rooms: Arc<dyn RoomDirectory>,
    policy: BookingPolicy,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a Tokio runtime.
    pub fn open(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        rooms: Arc<dyn RoomDirectory>,
        policy: BookingPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let snapshot = Snapshot::from_events(&events);
        let store = InMemoryStore::from_snapshot(&snapshot);
        info!(
            "replayed {} WAL records from {} ({} rows)",
            events.len(),
            wal_path.display(),
            snapshot.len()
        );

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(WalWriter { wal, snapshot }, wal_rx));

        Ok(Self {
            store,
            wal_tx,
            notify,
            rooms,
            policy,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    pub fn notify_hub(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Write one event via the group-commit writer; returns once it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Rewrite the WAL as one record per live row.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn publish(&self, kind: NotificationKind, recipient: Ulid, booking: &Booking, at: Ms) {
        self.notify
            .publish(Notification::about(kind, recipient, booking, at));
    }
}
