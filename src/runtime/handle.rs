use std::io;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    config::RuntimeConfig,
    core::store::Store,
    engine::resolver::{Query, QueryResult},
    error::{Error, Result},
    event::{Event, EventDraft, Row},
    log::RecoveryReport,
    types::Sequence,
};

use super::events::EngineEvent;

/// Cloneable async front end to a [`Store`].
///
/// Writes go through one writer task in submission order. Reads skip the
/// queue and run on the blocking pool against the shared store.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<EngineEvent>,
    store: Arc<Store>,
}

enum Command {
    Append {
        draft: EventDraft,
        resp: oneshot::Sender<Result<Sequence>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<Vec<(String, Sequence)>>>,
    },
    Recover {
        resp: oneshot::Sender<Result<RecoveryReport>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Starts the writer task. Must be called from inside a tokio runtime.
pub fn spawn_engine(store: Arc<Store>, config: RuntimeConfig) -> EngineHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(config.command_queue_bound.max(1));
    let (events_tx, _) = broadcast::channel::<EngineEvent>(config.event_channel_capacity.max(1));

    let events_tx_loop = events_tx.clone();
    let store_loop = Arc::clone(&store);

    tokio::spawn(async move {
        let mut appends_since_checkpoint = 0usize;
        while let Some(cmd) = cmd_rx.recv().await {
            let done = handle_command(
                cmd,
                &store_loop,
                &events_tx_loop,
                &config,
                &mut appends_since_checkpoint,
            )
            .await;
            if done {
                break;
            }
        }
        debug!("engine writer task stopped");
    });

    EngineHandle {
        cmd_tx,
        events_tx,
        store,
    }
}

impl EngineHandle {
    /// Subscribes to engine events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }

    /// The shared store, for synchronous reads.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Durably appends one event; resolves once it is on disk.
    pub async fn append(&self, draft: EventDraft) -> Result<Sequence> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Append { draft, resp: tx })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Appends an insert.
    pub async fn insert(&self, table: &str, key: impl AsRef<[u8]>, payload: impl Into<Vec<u8>>) -> Result<Sequence> {
        self.append(EventDraft::insert(table, key, payload)).await
    }

    /// Appends an update.
    pub async fn update(&self, table: &str, key: impl AsRef<[u8]>, payload: impl Into<Vec<u8>>) -> Result<Sequence> {
        self.append(EventDraft::update(table, key, payload)).await
    }

    /// Appends a soft delete.
    pub async fn soft_delete(&self, table: &str, key: impl AsRef<[u8]>) -> Result<Sequence> {
        self.append(EventDraft::soft_delete(table, key)).await
    }

    /// Appends a table drop.
    pub async fn drop_table(&self, table: &str) -> Result<Sequence> {
        self.append(EventDraft::drop_table(table)).await
    }

    /// Snapshots every table now.
    pub async fn checkpoint(&self) -> Result<Vec<(String, Sequence)>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Checkpoint { resp: tx })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Runs recovery between queued writes.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Recover { resp: tx })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Stops the writer task after the writes queued before it.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Shutdown { resp: tx })
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Runs a time-travel query.
    pub async fn query(&self, query: Query) -> Result<QueryResult> {
        run_blocking(&self.store, move |store| store.query(&query)).await
    }

    /// State of one key at `bound`.
    pub async fn state_as_of(
        &self,
        table: impl Into<String>,
        key: impl Into<Vec<u8>>,
        bound: Sequence,
        include_deleted: bool,
    ) -> Result<Option<Row>> {
        let table = table.into();
        let key = key.into();
        run_blocking(&self.store, move |store| store.state_as_of(&table, &key, bound, include_deleted)).await
    }

    /// Every event of one key, ascending.
    pub async fn history(&self, table: impl Into<String>, key: impl Into<Vec<u8>>) -> Result<Vec<Event>> {
        let table = table.into();
        let key = key.into();
        run_blocking(&self.store, move |store| store.history(&table, &key)).await
    }

    /// Sequence of the last committed event.
    pub fn latest_sequence(&self) -> Sequence {
        self.store.latest_sequence()
    }
}

async fn handle_command(
    cmd: Command,
    store: &Arc<Store>,
    events_tx: &broadcast::Sender<EngineEvent>,
    config: &RuntimeConfig,
    appends_since_checkpoint: &mut usize,
) -> bool {
    match cmd {
        Command::Append { draft, resp } => {
            let res = run_blocking(store, move |store| store.append_event(draft)).await;
            let out = res.map(|event| {
                let _ = events_tx.send(EngineEvent::Appended {
                    sequence: event.sequence,
                    table: event.table,
                    operation: event.operation,
                });
                event.sequence
            });
            let appended = out.is_ok();
            // Reply before checkpointing.
            let _ = resp.send(out);
            if appended {
                *appends_since_checkpoint += 1;
                maybe_auto_checkpoint(store, events_tx, config, appends_since_checkpoint).await;
            }
        }
        Command::Checkpoint { resp } => {
            let out = checkpoint(store, events_tx).await;
            if out.is_ok() {
                *appends_since_checkpoint = 0;
            }
            let _ = resp.send(out);
        }
        Command::Recover { resp } => {
            let out = run_blocking(store, |store| store.recover()).await;
            if let Ok(report) = &out {
                let _ = events_tx.send(EngineEvent::Recovered {
                    last_sequence: report.last_sequence,
                    truncated_bytes: report.truncated.as_ref().map(|t| t.discarded_bytes),
                });
            }
            let _ = resp.send(out);
        }
        Command::Shutdown { resp } => {
            let _ = resp.send(Ok(()));
            return true;
        }
    }

    false
}

async fn checkpoint(
    store: &Arc<Store>,
    events_tx: &broadcast::Sender<EngineEvent>,
) -> Result<Vec<(String, Sequence)>> {
    let written = run_blocking(store, |store| store.checkpoint_all()).await?;
    for (table, sequence) in &written {
        let _ = events_tx.send(EngineEvent::CheckpointWritten {
            table: table.clone(),
            sequence: *sequence,
        });
    }
    Ok(written)
}

async fn maybe_auto_checkpoint(
    store: &Arc<Store>,
    events_tx: &broadcast::Sender<EngineEvent>,
    config: &RuntimeConfig,
    appends_since_checkpoint: &mut usize,
) {
    if config.checkpoint_every_appends == 0
        || *appends_since_checkpoint < config.checkpoint_every_appends
        || !store.has_snapshots()
    {
        return;
    }

    if let Err(err) = checkpoint(store, events_tx).await {
        warn!(%err, "automatic checkpoint failed");
    }
    *appends_since_checkpoint = 0;
}

async fn run_blocking<T, F>(store: &Arc<Store>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| Error::Io(io::Error::other(format!("join error: {e}"))))?
}
