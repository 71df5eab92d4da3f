mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod policy;
mod provider;
mod queries;
mod reservations;
mod slots;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{candidates_for_date, expand, resolve, Candidate};
pub use error::EngineError;
pub use ledger::CreditLedger;
pub use policy::{default_policy, refund_amount, refund_percentage, refund_tier};
pub use provider::{
    provider_for, AvailabilityMode, AvailabilityProvider, Claim, CuratedSlotProvider, RuleProvider,
};
pub use store::Book;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::{error, info};

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        commit: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Commit,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Commit, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches commits for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { commit, response } => {
                let mut batch = vec![(commit, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { commit, response }) => {
                            batch.push((commit, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush failed for {} commits: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    for (commit, _) in batch {
        if let Err(e) = wal.append_buffered(commit) {
            // Nothing from a failed batch may reach the log.
            if let Err(cut) = wal.rollback() {
                error!("WAL rollback failed: {cut}");
            }
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { commit, response } => {
            let mut batch = vec![(commit, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

/// Booking engine for one schedule owner.
///
/// All five tables live in one [`Book`] behind a single lock. Every write
/// path takes the owned write guard, validates, and hands the guard to
/// [`Engine::commit`], so checks and effects form one serializable unit.
pub struct Engine {
    book: Arc<RwLock<Book>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn AvailabilityProvider>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        mode: AvailabilityMode,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let commits = replay.commits;
        let mut book = Book::default();
        for commit in &commits {
            for event in &commit.events {
                book.apply(event);
            }
        }
        info!(
            "replayed {} commits from {} ({} reservations)",
            commits.len(),
            wal_path.display(),
            book.reservations().count()
        );

        let wal = Wal::open(&wal_path, replay.valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            book: Arc::new(RwLock::new(book)),
            wal_tx,
            notify,
            clock,
            provider: Arc::from(provider_for(mode)),
        })
    }

    pub fn mode(&self) -> AvailabilityMode {
        self.provider.mode()
    }

    /// Canonical server time for every business rule.
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    pub(super) fn provider(&self) -> &dyn AvailabilityProvider {
        self.provider.as_ref()
    }

    pub(super) async fn read(&self) -> RwLockReadGuard<'_, Book> {
        self.book.read().await
    }

    pub(super) async fn write(&self) -> OwnedRwLockWriteGuard<Book> {
        self.book.clone().write_owned().await
    }

    async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, commit: Commit) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append { commit, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    /// Make `events` durable as one WAL record, then apply them under `guard`.
    ///
    /// Runs in its own task so a caller dropped mid-commit cannot leave the
    /// log and memory disagreeing. Nothing is applied if the append fails.
    pub(super) async fn commit(
        &self,
        guard: OwnedRwLockWriteGuard<Book>,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        if events.is_empty() {
            return Ok(());
        }
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            let mut guard = guard;
            let commit = Commit { events };
            Self::wal_append(&wal_tx, commit.clone()).await?;
            for event in &commit.events {
                guard.apply(event);
            }
            Ok::<(), EngineError>(())
        });
        task.await
            .map_err(|e| EngineError::Persistence(format!("commit task failed: {e}")))?
    }

    /// Rewrite the WAL as a snapshot of current state.
    ///
    /// The read guard is held until the swap lands, so no commit can slip in
    /// between snapshot and rename.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let guard = self.book.read().await;
        let snapshot = guard.snapshot();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()));
        drop(guard);
        result
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
}
