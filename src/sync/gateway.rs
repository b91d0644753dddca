use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::calendar::{Event, EventBook, LocalId};
use crate::storage::mutation_store::{EventKey, Mutation, MutationStore, StoreError};
use crate::sync::network::NetworkMonitor;
use crate::sync::remote_api::{ApiError, EventApi};
use crate::sync::sync_engine::SyncEngine;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Event title is required")]
    EmptyTitle,
    #[error("Unknown event {0}")]
    UnknownEvent(LocalId),
    #[error("Could not keep the change locally: {0}")]
    StorageUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Synced,
    QueuedLocally,
    CancelledLocally,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub title: String,
    pub description: String,
    pub title_color: Option<String>,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

impl EventDraft {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            title_color: None,
            start,
            end: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_title_color(mut self, color: impl Into<String>) -> Self {
        self.title_color = Some(color.into());
        self
    }

    fn apply_to(self, event: &mut Event) {
        event.title = self.title.trim().to_string();
        event.description = self.description.trim().to_string();
        if let Some(color) = self.title_color {
            event.title_color = color;
        }
        event.start = self.start;
        event.end = self.end;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventCommand {
    Create(EventDraft),
    Edit { local_id: LocalId, draft: EventDraft },
    Move { local_id: LocalId, start: DateTime<Utc>, end: Option<DateTime<Utc>> },
    Delete { local_id: LocalId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub local_id: LocalId,
    pub delivery: Delivery,
}

#[derive(Clone)]
pub struct MutationGateway {
    store: MutationStore,
    api: Arc<dyn EventApi>,
    monitor: NetworkMonitor,
    book: EventBook,
    engine: SyncEngine,
}

impl MutationGateway {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            store: engine.store().clone(),
            api: Arc::clone(engine.api()),
            monitor: engine.monitor().clone(),
            book: engine.book().clone(),
            engine,
        }
    }

    pub fn book(&self) -> &EventBook {
        &self.book
    }

    pub async fn execute(&self, command: EventCommand) -> Result<CommandOutcome, GatewayError> {
        match command {
            EventCommand::Create(draft) => {
                let mut event = Event::new(String::new(), draft.start);
                draft.apply_to(&mut event);
                if !event.has_title() {
                    return Err(GatewayError::EmptyTitle);
                }
                let local_id = event.local_id;
                let _event_lock = self.engine.locks().acquire(local_id).await;
                self.book.upsert(event.clone());
                let delivery = self.save_locked(&mut event).await.inspect_err(|_| {
                    self.book.remove(local_id);
                })?;
                Ok(CommandOutcome { local_id, delivery })
            }
            EventCommand::Edit { local_id, draft } => {
                let _event_lock = self.engine.locks().acquire(local_id).await;
                let mut event = self.tracked(local_id)?;
                draft.apply_to(&mut event);
                self.book.upsert(event.clone());
                let delivery = self.save_locked(&mut event).await?;
                Ok(CommandOutcome { local_id, delivery })
            }
            EventCommand::Move { local_id, start, end } => {
                let _event_lock = self.engine.locks().acquire(local_id).await;
                let mut event = self.tracked(local_id)?;
                event.start = start;
                event.end = Some(end.unwrap_or(start));
                self.book.upsert(event.clone());
                let delivery = self.save_locked(&mut event).await?;
                Ok(CommandOutcome { local_id, delivery })
            }
            EventCommand::Delete { local_id } => {
                let _event_lock = self.engine.locks().acquire(local_id).await;
                let event = self.tracked(local_id)?;
                let delivery = self.delete_locked(&event).await?;
                Ok(CommandOutcome { local_id, delivery })
            }
        }
    }

    pub async fn save(&self, event: &mut Event) -> Result<Delivery, GatewayError> {
        let _event_lock = self.engine.locks().acquire(event.local_id).await;
        self.adopt_assigned_id(event);
        self.save_locked(event).await
    }

    pub async fn delete(&self, event: &Event) -> Result<Delivery, GatewayError> {
        let _event_lock = self.engine.locks().acquire(event.local_id).await;
        let mut event = event.clone();
        self.adopt_assigned_id(&mut event);
        self.delete_locked(&event).await
    }

    async fn save_locked(&self, event: &mut Event) -> Result<Delivery, GatewayError> {
        if event.is_draft() && !event.has_title() {
            return Err(GatewayError::EmptyTitle);
        }

        let key = EventKey::for_event(event);
        if self.has_pending(key).await {
            tracing::debug!("{} already has a pending change, superseding it", key);
        } else if self.monitor.is_online() {
            match self.api.save_event(event).await {
                Ok(ack) => {
                    if let (None, Some(id)) = (event.id, ack.id) {
                        event.id = Some(id);
                        tracing::info!("Event {} created with id {}", event.local_id, id);
                    } else if event.id.is_none() {
                        tracing::warn!("Create of {} acknowledged without an id", event.local_id);
                        return self.enqueue(Mutation::Upsert(event.clone()), event).await;
                    }
                    self.book.upsert(event.clone());
                    self.after_direct_success().await;
                    return Ok(Delivery::Synced);
                }
                Err(e) => log_fallback("save", &e),
            }
        }

        self.enqueue(Mutation::Upsert(event.clone()), event).await
    }

    async fn delete_locked(&self, event: &Event) -> Result<Delivery, GatewayError> {
        self.book.remove(event.local_id);

        let Some(id) = event.id else {
            let cancelled = self.store.cancel(EventKey::Draft(event.local_id)).await?;
            tracing::info!(
                "Discarded unsynced event {} (pending create cancelled: {})",
                event.local_id,
                cancelled
            );
            return Ok(Delivery::CancelledLocally);
        };

        let key = EventKey::Remote(id);
        if self.has_pending(key).await {
            tracing::debug!("{} already has a pending change, superseding it", key);
        } else if self.monitor.is_online() {
            match self.api.delete_event(id).await {
                Ok(()) | Err(ApiError::NotFound(_)) => {
                    self.after_direct_success().await;
                    return Ok(Delivery::Synced);
                }
                Err(e) => log_fallback("delete", &e),
            }
        }

        self.store.put(Mutation::Delete { id }).await.inspect_err(|e| {
            tracing::error!("Failed to queue delete of event {}: {}", id, e);
        })?;
        Ok(Delivery::QueuedLocally)
    }

    // A copy taken before its create was acknowledged still has no id.
    fn adopt_assigned_id(&self, event: &mut Event) {
        if event.id.is_none()
            && let Some(id) = self.book.get(event.local_id).and_then(|known| known.id)
        {
            event.id = Some(id);
        }
    }

    fn tracked(&self, local_id: LocalId) -> Result<Event, GatewayError> {
        self.book.get(local_id).ok_or(GatewayError::UnknownEvent(local_id))
    }

    async fn enqueue(&self, mutation: Mutation, event: &Event) -> Result<Delivery, GatewayError> {
        self.store.put(mutation).await.inspect_err(|e| {
            tracing::error!("Failed to queue change to event {}: {}", event.local_id, e);
        })?;
        self.book.upsert(event.clone());
        Ok(Delivery::QueuedLocally)
    }

    // A storage failure here only costs the ordering shortcut; the enqueue
    // path reports it if it persists.
    async fn has_pending(&self, key: EventKey) -> bool {
        match self.store.find(key).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!("Could not check pending changes for {}: {}", key, e);
                false
            }
        }
    }

    async fn after_direct_success(&self) {
        if let Ok(false) = self.store.is_empty().await {
            self.engine.request_drain();
        }
    }
}

fn log_fallback(action: &str, error: &ApiError) {
    tracing::warn!("Remote {} failed, queueing locally: {}", action, error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::remote_api::{MockEventApi, SaveAck};
    use crate::sync::sync_engine::DrainOutcome;
    use crate::sync::testing::FakeRemote;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rusqlite::Connection;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    fn nine_am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
    }

    fn gateway_with(api: Arc<dyn EventApi>, online: bool) -> MutationGateway {
        MutationGateway::new(SyncEngine::new(
            MutationStore::open_in_memory().unwrap(),
            api,
            NetworkMonitor::new(online),
            EventBook::new(),
        ))
    }

    #[tokio::test]
    async fn online_create_writes_server_id_back() {
        let mut api = MockEventApi::new();
        api.expect_save_event()
            .times(1)
            .returning(|_| Ok(SaveAck { id: Some(42) }));
        let gateway = gateway_with(Arc::new(api), true);
        let mut event = Event::new("Standup", nine_am());

        let delivery = gateway.save(&mut event).await.unwrap();

        assert_eq!(delivery, Delivery::Synced);
        assert_eq!(event.id, Some(42));
        assert_eq!(gateway.book().get(event.local_id).unwrap().id, Some(42));
        assert!(gateway.store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn remote_failure_while_online_falls_back_to_queue() {
        let mut api = MockEventApi::new();
        api.expect_save_event()
            .times(1)
            .returning(|_| Err(ApiError::Rejected("busy".to_string())));
        let gateway = gateway_with(Arc::new(api), true);
        let mut event = Event::new("Standup", nine_am());

        let delivery = gateway.save(&mut event).await.unwrap();

        assert_eq!(delivery, Delivery::QueuedLocally);
        assert_eq!(event.id, None);
        assert_eq!(gateway.store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_save_does_not_call_remote() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);
        let mut event = Event::new("Standup", nine_am());

        let delivery = gateway.save(&mut event).await.unwrap();

        assert_eq!(delivery, Delivery::QueuedLocally);
        assert!(gateway.book().get(event.local_id).is_some());
    }

    #[tokio::test]
    async fn rejects_create_without_title() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);
        let mut event = Event::new("  ", nine_am());

        let result = gateway.save(&mut event).await;

        assert!(matches!(result, Err(GatewayError::EmptyTitle)));
        assert!(gateway.store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn storage_failure_is_reported() {
        let store = MutationStore::new(Connection::open_in_memory().unwrap());
        let gateway = MutationGateway::new(SyncEngine::new(
            store,
            Arc::new(MockEventApi::new()),
            NetworkMonitor::new(false),
            EventBook::new(),
        ));
        let mut event = Event::new("Standup", nine_am());

        let result = gateway.save(&mut event).await;

        assert!(matches!(result, Err(GatewayError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn pending_change_is_superseded_even_when_online() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);
        let mut event = Event::new("Standup", nine_am()).with_remote_id(5);
        gateway.save(&mut event).await.unwrap();

        gateway.monitor.report(true);
        event.title = "Standup (moved)".to_string();
        let delivery = gateway.save(&mut event).await.unwrap();

        assert_eq!(delivery, Delivery::QueuedLocally);
        let pending = gateway.store.get_all().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].mutation, Mutation::Upsert(event));
    }

    #[tokio::test]
    async fn offline_create_then_edit_collapses_into_one_create() {
        let remote = Arc::new(FakeRemote::new());
        let gateway = gateway_with(remote.clone(), false);
        let created = gateway
            .execute(EventCommand::Create(EventDraft::new("Standup", nine_am())))
            .await
            .unwrap();
        gateway
            .execute(EventCommand::Edit {
                local_id: created.local_id,
                draft: EventDraft::new("Standup", nine_am())
                    .with_description("daily sync")
                    .with_title_color("#33b679"),
            })
            .await
            .unwrap();
        assert_eq!(gateway.store.len().await.unwrap(), 1);

        gateway.monitor.report(true);
        let outcome = gateway.engine.drain().await.unwrap();

        assert!(matches!(outcome, DrainOutcome::Completed(_)));
        assert_eq!(remote.calls(), vec!["create Standup"]);
        let stored = remote.events();
        assert_eq!(stored[0].description, "daily sync");
        assert_eq!(stored[0].title_color, "#33b679");
        assert_eq!(gateway.book().get(created.local_id).unwrap().id, Some(1));
    }

    #[tokio::test]
    async fn deleting_unsynced_event_cancels_its_create() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);
        let created = gateway
            .execute(EventCommand::Create(EventDraft::new("Standup", nine_am())))
            .await
            .unwrap();

        let deleted = gateway
            .execute(EventCommand::Delete { local_id: created.local_id })
            .await
            .unwrap();

        assert_eq!(deleted.delivery, Delivery::CancelledLocally);
        assert!(gateway.store.is_empty().await.unwrap());
        assert!(gateway.book().is_empty());
    }

    #[tokio::test]
    async fn deleting_already_missing_event_online_is_synced() {
        let mut api = MockEventApi::new();
        api.expect_delete_event()
            .times(1)
            .returning(|id| Err(ApiError::NotFound(id.to_string())));
        let gateway = gateway_with(Arc::new(api), true);
        let event = Event::new("Standup", nine_am()).with_remote_id(3);

        let delivery = gateway.delete(&event).await.unwrap();

        assert_eq!(delivery, Delivery::Synced);
        assert!(gateway.store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn offline_delete_is_queued() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);
        let event = Event::new("Standup", nine_am()).with_remote_id(3);

        let delivery = gateway.delete(&event).await.unwrap();

        assert_eq!(delivery, Delivery::QueuedLocally);
        let pending = gateway.store.get_all().await.unwrap();
        assert_eq!(pending[0].mutation, Mutation::Delete { id: 3 });
    }

    #[tokio::test]
    async fn move_defaults_end_to_start() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);
        let created = gateway
            .execute(EventCommand::Create(EventDraft::new("Standup", nine_am())))
            .await
            .unwrap();
        let later = nine_am() + chrono::Duration::days(1);

        gateway
            .execute(EventCommand::Move { local_id: created.local_id, start: later, end: None })
            .await
            .unwrap();

        let moved = gateway.book().get(created.local_id).unwrap();
        assert_eq!(moved.start, later);
        assert_eq!(moved.end, Some(later));
    }

    #[tokio::test]
    async fn edit_of_unknown_event_is_rejected() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);

        let result = gateway
            .execute(EventCommand::Edit {
                local_id: LocalId::new(),
                draft: EventDraft::new("Standup", nine_am()),
            })
            .await;

        assert!(matches!(result, Err(GatewayError::UnknownEvent(_))));
    }

    #[tokio::test]
    async fn create_command_without_title_leaves_book_untouched() {
        let gateway = gateway_with(Arc::new(MockEventApi::new()), false);

        let result = gateway
            .execute(EventCommand::Create(EventDraft::new("", nine_am())))
            .await;

        assert!(matches!(result, Err(GatewayError::EmptyTitle)));
        assert!(gateway.book().is_empty());
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn spawn_create(gateway: &MutationGateway, title: &str) -> JoinHandle<Result<CommandOutcome, GatewayError>> {
        let gateway = gateway.clone();
        let draft = EventDraft::new(title, nine_am());
        tokio::spawn(async move { gateway.execute(EventCommand::Create(draft)).await })
    }

    fn only_event(gateway: &MutationGateway) -> LocalId {
        gateway.book().snapshot()[0].local_id
    }

    #[tokio::test]
    async fn delete_during_direct_create_removes_created_event() {
        let remote = Arc::new(FakeRemote::new().with_latency(Duration::from_millis(200)));
        let gateway = gateway_with(remote.clone(), true);
        let creating = spawn_create(&gateway, "Standup");
        eventually(|| !gateway.book().is_empty()).await;

        let deleted = gateway
            .execute(EventCommand::Delete { local_id: only_event(&gateway) })
            .await
            .unwrap();
        let created = creating.await.unwrap().unwrap();

        assert_eq!(created.delivery, Delivery::Synced);
        assert_eq!(deleted.delivery, Delivery::Synced);
        assert_eq!(remote.calls(), vec!["create Standup", "delete 1"]);
        assert!(remote.titles().is_empty());
        assert!(gateway.book().is_empty());
        assert!(gateway.store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn edit_during_direct_create_updates_the_created_event() {
        let remote = Arc::new(FakeRemote::new().with_latency(Duration::from_millis(200)));
        let gateway = gateway_with(remote.clone(), true);
        let creating = spawn_create(&gateway, "Standup");
        eventually(|| !gateway.book().is_empty()).await;
        let local_id = only_event(&gateway);

        gateway
            .execute(EventCommand::Edit {
                local_id,
                draft: EventDraft::new("Standup v2", nine_am()),
            })
            .await
            .unwrap();
        creating.await.unwrap().unwrap();

        assert_eq!(remote.calls(), vec!["create Standup", "update 1"]);
        assert_eq!(remote.titles(), vec!["Standup v2"]);
        let edited = gateway.book().get(local_id).unwrap();
        assert_eq!((edited.id, edited.title.as_str()), (Some(1), "Standup v2"));
    }

    #[tokio::test]
    async fn delete_during_replayed_create_reaches_remote() {
        let remote = Arc::new(FakeRemote::new().with_latency(Duration::from_millis(200)));
        let gateway = gateway_with(remote.clone(), false);
        let created = gateway
            .execute(EventCommand::Create(EventDraft::new("Standup", nine_am())))
            .await
            .unwrap();
        gateway.monitor.report(true);
        let draining = {
            let engine = gateway.engine.clone();
            tokio::spawn(async move { engine.drain().await })
        };
        eventually(|| gateway.engine.locks().is_held(created.local_id)).await;

        let deleted = gateway
            .execute(EventCommand::Delete { local_id: created.local_id })
            .await
            .unwrap();
        draining.await.unwrap().unwrap();

        assert_eq!(deleted.delivery, Delivery::Synced);
        assert_eq!(remote.calls(), vec!["create Standup", "delete 1"]);
        assert!(remote.titles().is_empty());
        assert!(gateway.store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn stale_copy_saves_as_update_after_create() {
        let remote = Arc::new(FakeRemote::new());
        let gateway = gateway_with(remote.clone(), true);
        let created = gateway
            .execute(EventCommand::Create(EventDraft::new("Standup", nine_am())))
            .await
            .unwrap();
        let mut stale = gateway.book().get(created.local_id).unwrap();
        stale.id = None;
        stale.title = "Standup v2".to_string();

        let delivery = gateway.save(&mut stale).await.unwrap();

        assert_eq!(delivery, Delivery::Synced);
        assert_eq!(stale.id, Some(1));
        assert_eq!(remote.calls(), vec!["create Standup", "update 1"]);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Create(usize, u8),
        Edit(usize, u8),
        Delete(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0..3usize, any::<u8>()).prop_map(|(slot, n)| Step::Create(slot, n)),
            (0..3usize, any::<u8>()).prop_map(|(slot, n)| Step::Edit(slot, n)),
            (0..3usize).prop_map(Step::Delete),
        ]
    }

    async fn apply_steps(gateway: &MutationGateway, steps: &[Step]) {
        let mut slots: [Option<LocalId>; 3] = [None; 3];
        for step in steps {
            match *step {
                Step::Create(slot, n) if slots[slot].is_none() => {
                    let outcome = gateway
                        .execute(EventCommand::Create(EventDraft::new(format!("event {}", n), nine_am())))
                        .await
                        .unwrap();
                    slots[slot] = Some(outcome.local_id);
                }
                Step::Edit(slot, n) => {
                    if let Some(local_id) = slots[slot] {
                        gateway
                            .execute(EventCommand::Edit {
                                local_id,
                                draft: EventDraft::new(format!("edited {}", n), nine_am())
                                    .with_description(format!("note {}", n))
                                    .with_title_color(format!("#{:02x}{:02x}{:02x}", n, n / 2, n / 3)),
                            })
                            .await
                            .unwrap();
                    }
                }
                Step::Delete(slot) => {
                    if let Some(local_id) = slots[slot].take() {
                        gateway.execute(EventCommand::Delete { local_id }).await.unwrap();
                    }
                }
                Step::Create(..) => {}
            }
        }
    }

    fn contents(remote: &FakeRemote) -> Vec<(String, String, String)> {
        let mut events: Vec<_> = remote
            .events()
            .into_iter()
            .map(|e| (e.title, e.description, e.title_color))
            .collect();
        events.sort();
        events
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn offline_replay_matches_online_result(steps in prop::collection::vec(step(), 0..12)) {
            let (online_events, offline_events, leftover) = tokio_test::block_on(async {
                let online_remote = Arc::new(FakeRemote::new());
                let online = gateway_with(online_remote.clone(), true);
                apply_steps(&online, &steps).await;

                let offline_remote = Arc::new(FakeRemote::new());
                let offline = gateway_with(offline_remote.clone(), false);
                apply_steps(&offline, &steps).await;
                offline.monitor.report(true);
                offline.engine.drain().await.unwrap();

                (
                    contents(&online_remote),
                    contents(&offline_remote),
                    offline.store.len().await.unwrap(),
                )
            });

            prop_assert_eq!(online_events, offline_events);
            prop_assert_eq!(leftover, 0);
        }
    }
}
