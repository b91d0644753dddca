use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::calendar::{Event, EventBook, LocalId, RemoteId};
use crate::storage::mutation_store::{LocalKey, Mutation, MutationStore, PendingMutation, StoreError};
use crate::sync::event_lock::EventLocks;
use crate::sync::network::{NetworkMonitor, NetworkSignal};
use crate::sync::remote_api::{ApiError, EventApi};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Draining,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    RemoteFailure(String),
    WentOffline,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub replayed: usize,
    pub remaining: usize,
    pub passes: usize,
    pub stopped: Option<StopReason>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain was running; it will re-read the store before going idle.
    AlreadyDraining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Replayed {
    Saved,
    Created { local_id: LocalId, id: RemoteId },
    Deleted,
}

#[derive(Default)]
struct DrainGate {
    draining: AtomicBool,
    rerun_requested: AtomicBool,
}

struct DrainingFlag<'a>(&'a AtomicBool);

impl Drop for DrainingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    store: MutationStore,
    api: Arc<dyn EventApi>,
    monitor: NetworkMonitor,
    book: EventBook,
    gate: Arc<DrainGate>,
    locks: EventLocks,
}

impl SyncEngine {
    pub fn new(
        store: MutationStore,
        api: Arc<dyn EventApi>,
        monitor: NetworkMonitor,
        book: EventBook,
    ) -> Self {
        Self {
            store,
            api,
            monitor,
            book,
            gate: Arc::new(DrainGate::default()),
            locks: EventLocks::default(),
        }
    }

    pub fn store(&self) -> &MutationStore {
        &self.store
    }

    pub fn api(&self) -> &Arc<dyn EventApi> {
        &self.api
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    pub fn book(&self) -> &EventBook {
        &self.book
    }

    pub(crate) fn locks(&self) -> &EventLocks {
        &self.locks
    }

    pub fn state(&self) -> SyncState {
        if self.gate.draining.load(Ordering::SeqCst) {
            SyncState::Draining
        } else {
            SyncState::Idle
        }
    }

    pub async fn drain(&self) -> Result<DrainOutcome, SyncError> {
        if self.gate.draining.swap(true, Ordering::SeqCst) {
            self.gate.rerun_requested.store(true, Ordering::SeqCst);
            tracing::debug!("Drain already running, scheduling another pass");
            return Ok(DrainOutcome::AlreadyDraining);
        }

        let mut report = DrainReport::default();
        loop {
            {
                let _flag = DrainingFlag(&self.gate.draining);
                loop {
                    self.gate.rerun_requested.store(false, Ordering::SeqCst);
                    let pass = self.drain_pass().await?;
                    report.replayed += pass.replayed;
                    report.remaining = pass.remaining;
                    report.passes += 1;
                    if pass.stopped.is_some() {
                        report.stopped = pass.stopped;
                        return Ok(DrainOutcome::Completed(report));
                    }
                    if !self.gate.rerun_requested.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }

            // A request can land between the last check and releasing the flag.
            if !self.gate.rerun_requested.load(Ordering::SeqCst)
                || self.gate.draining.swap(true, Ordering::SeqCst)
            {
                return Ok(DrainOutcome::Completed(report));
            }
        }
    }

    pub fn request_drain(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move { engine.drain_logged().await })
    }

    pub fn spawn(self, retry_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(self.run(retry_interval))
    }

    pub async fn run(self, retry_interval: Duration) {
        let mut signals = self.monitor.subscribe();
        let mut ticker = tokio::time::interval(retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                signal = signals.recv() => match signal {
                    Ok(NetworkSignal::WentOnline) => self.drain_logged().await,
                    Ok(NetworkSignal::WentOffline) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} connectivity signals", skipped);
                        if self.monitor.is_online() {
                            self.drain_logged().await;
                        }
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    if self.monitor.is_online() {
                        self.drain_logged().await;
                    }
                }
            }
        }
    }

    pub async fn refresh_events(&self) -> Result<Vec<Event>, SyncError> {
        let remote = self.api.fetch_events().await?;
        let pending = self.store.get_all().await?;
        self.book.replace_from_remote(remote, &pending);
        Ok(self.book.snapshot())
    }

    async fn drain_logged(&self) {
        match self.drain().await {
            Ok(DrainOutcome::Completed(report)) if report.replayed > 0 || report.stopped.is_some() => {
                tracing::info!(
                    "Drain finished: {} replayed, {} remaining, stopped: {:?}",
                    report.replayed,
                    report.remaining,
                    report.stopped
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Drain failed: {}", e),
        }
    }

    async fn drain_pass(&self) -> Result<DrainReport, SyncError> {
        let pending = self.store.get_all().await?;
        let mut report = DrainReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        tracing::info!("Draining {} pending mutations", pending.len());

        for queued in &pending {
            if !self.monitor.is_online() {
                tracing::info!("Went offline, pausing drain");
                report.stopped = Some(StopReason::WentOffline);
                break;
            }

            let _event_lock = match &queued.mutation {
                Mutation::Upsert(event) => Some(self.locks.acquire(event.local_id).await),
                Mutation::Delete { .. } => None,
            };
            // The gateway may have superseded or cancelled the entry while
            // this pass waited for the event.
            let Some(entry) = self.store.find(queued.mutation.event_key()).await? else {
                continue;
            };

            match self.replay(&entry).await {
                Ok(replayed) => {
                    self.settle(entry.local_key, replayed).await?;
                    report.replayed += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Replay of {} mutation for {} failed, keeping it for the next drain: {}",
                        entry.kind().as_str(),
                        entry.event_key,
                        e
                    );
                    report.stopped = Some(StopReason::RemoteFailure(e.to_string()));
                    break;
                }
            }
        }

        report.remaining = self.store.len().await?;
        Ok(report)
    }

    async fn replay(&self, entry: &PendingMutation) -> Result<Replayed, ApiError> {
        match &entry.mutation {
            Mutation::Upsert(event) => {
                let ack = self.api.save_event(event).await.inspect_err(|e| {
                    if let (ApiError::NotFound(_), Some(id)) = (e, event.id) {
                        tracing::warn!(
                            "Event {} no longer exists remotely; its pending update will block the queue until the event is deleted locally",
                            id
                        );
                    }
                })?;
                match event.id {
                    Some(_) => Ok(Replayed::Saved),
                    None => {
                        let id = ack.id.ok_or_else(|| {
                            ApiError::Malformed("create acknowledged without an id".to_string())
                        })?;
                        Ok(Replayed::Created {
                            local_id: event.local_id,
                            id,
                        })
                    }
                }
            }
            Mutation::Delete { id } => match self.api.delete_event(*id).await {
                Ok(()) => Ok(Replayed::Deleted),
                Err(ApiError::NotFound(_)) => {
                    tracing::info!("Event {} was already gone remotely", id);
                    Ok(Replayed::Deleted)
                }
                Err(e) => Err(e),
            },
        }
    }

    pub(crate) async fn settle(&self, local_key: LocalKey, replayed: Replayed) -> Result<(), SyncError> {
        let removed = self.store.remove(local_key).await?;

        if let Replayed::Created { local_id, id } = replayed {
            tracing::info!("Event {} created remotely with id {}", local_id, id);
            if !self.book.assign_id(local_id, id) {
                tracing::debug!("Event {} is not loaded, id {} kept in the store only", local_id, id);
            }

            // The entry was replaced while its create was in flight: either
            // a newer edit (re-key it) or a local delete (undo the create).
            if !removed && !self.store.assign_remote_id(local_id, id).await? {
                tracing::info!("Event {} was deleted while being created, queueing delete", id);
                self.book.remove(local_id);
                self.store.put(Mutation::Delete { id }).await?;
            }
        }
        Ok(())
    }
}
