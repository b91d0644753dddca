use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OwnedMutexGuard;

use crate::calendar::LocalId;

type Slot = Arc<tokio::sync::Mutex<()>>;

// One async mutex per event that currently has work in progress. The gateway
// and the drain both take it, so a remote call for an event and the id
// write-back that follows it are never interleaved with another command on
// the same event.
#[derive(Clone, Default)]
pub(crate) struct EventLocks {
    slots: Arc<Mutex<HashMap<LocalId, Slot>>>,
}

pub(crate) struct EventGuard {
    local_id: LocalId,
    held: Option<OwnedMutexGuard<()>>,
    locks: EventLocks,
}

impl EventLocks {
    pub(crate) async fn acquire(&self, local_id: LocalId) -> EventGuard {
        let slot = Arc::clone(self.slots().entry(local_id).or_default());
        let held = slot.lock_owned().await;
        EventGuard {
            local_id,
            held: Some(held),
            locks: self.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, local_id: LocalId) -> bool {
        self.slots()
            .get(&local_id)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<LocalId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        self.held.take();
        let mut slots = self.locks.slots();
        // Waiters hold their own clone of the slot.
        if let Some(slot) = slots.get(&self.local_id)
            && Arc::strong_count(slot) == 1
        {
            slots.remove(&self.local_id);
        }
    }
}
