use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::calendar::{Event, LocalId, RemoteId};
use crate::storage::mutation_store::{Mutation, PendingMutation};

#[derive(Clone, Default)]
pub struct EventBook {
    events: Arc<RwLock<HashMap<LocalId, Event>>>,
}

impl EventBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, event: Event) {
        self.write().insert(event.local_id, event);
    }

    pub fn remove(&self, local_id: LocalId) -> Option<Event> {
        self.write().remove(&local_id)
    }

    pub fn get(&self, local_id: LocalId) -> Option<Event> {
        self.read().get(&local_id).cloned()
    }

    /// Returns false when the event is no longer in the book.
    pub fn assign_id(&self, local_id: LocalId, id: RemoteId) -> bool {
        match self.write().get_mut(&local_id) {
            Some(event) => {
                event.id = Some(id);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .read()
            .values()
            .cloned()
            .map(|mut event| {
                event.end = Some(event.effective_end());
                event
            })
            .collect();
        events.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.title.cmp(&b.title)));
        events
    }

    pub fn replace_from_remote(&self, remote: Vec<Event>, pending: &[PendingMutation]) {
        let mut events = self.write();
        let known: HashMap<RemoteId, LocalId> = events
            .values()
            .filter_map(|event| event.id.map(|id| (id, event.local_id)))
            .collect();

        let mut rebuilt: HashMap<LocalId, Event> = HashMap::with_capacity(remote.len());
        for mut event in remote {
            if let Some(local_id) = event.id.and_then(|id| known.get(&id)) {
                event.local_id = *local_id;
            }
            rebuilt.insert(event.local_id, event);
        }

        for entry in pending {
            match &entry.mutation {
                Mutation::Upsert(event) => {
                    if let Some(id) = event.id {
                        rebuilt.retain(|_, existing| existing.id != Some(id));
                    }
                    rebuilt.insert(event.local_id, event.clone());
                }
                Mutation::Delete { id } => {
                    rebuilt.retain(|_, existing| existing.id != Some(*id));
                }
            }
        }

        *events = rebuilt;
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<LocalId, Event>> {
        self.events.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<LocalId, Event>> {
        self.events.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
