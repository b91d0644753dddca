use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::calendar::{Event, RemoteId};
use crate::sync::network::NetworkMonitor;
use crate::sync::remote_api::{ApiError, EventApi, SaveAck};

#[derive(Default)]
struct RemoteState {
    events: BTreeMap<RemoteId, Event>,
    next_id: RemoteId,
    calls: Vec<String>,
    failing_calls: HashSet<usize>,
    offline_after: Option<(usize, NetworkMonitor)>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
    latency: Option<Duration>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn fail_call(&self, n: usize) {
        self.state.lock().unwrap().failing_calls.insert(n);
    }

    pub fn go_offline_after(&self, calls: usize, monitor: NetworkMonitor) {
        self.state.lock().unwrap().offline_after = Some((calls, monitor));
    }

    pub fn seed(&self, event: Event) {
        let mut state = self.state.lock().unwrap();
        let id = event.id.expect("seeded events need an id");
        state.next_id = state.next_id.max(id);
        state.events.insert(id, event);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.values().cloned().collect()
    }

    pub fn titles(&self) -> Vec<String> {
        let mut titles: Vec<String> = self.events().into_iter().map(|e| e.title).collect();
        titles.sort();
        titles
    }

    async fn begin_call(&self, label: String) -> Result<(), ApiError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock().unwrap();
        let n = state.calls.len() + 1;
        if state.failing_calls.remove(&n) {
            state.calls.push(format!("{} (failed)", label));
            return Err(ApiError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        state.calls.push(label);
        if let Some((after, monitor)) = &state.offline_after {
            if *after == n {
                monitor.report(false);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventApi for FakeRemote {
    async fn fetch_events(&self) -> Result<Vec<Event>, ApiError> {
        Ok(self.events())
    }

    async fn save_event(&self, event: &Event) -> Result<SaveAck, ApiError> {
        let label = match event.id {
            Some(id) => format!("update {}", id),
            None => format!("create {}", event.title),
        };
        self.begin_call(label).await?;

        let mut state = self.state.lock().unwrap();
        match event.id {
            Some(id) => {
                if !state.events.contains_key(&id) {
                    return Err(ApiError::NotFound(id.to_string()));
                }
                state.events.insert(id, event.clone());
                Ok(SaveAck { id: Some(id) })
            }
            None => {
                state.next_id += 1;
                let id = state.next_id;
                state.events.insert(id, event.clone().with_remote_id(id));
                Ok(SaveAck { id: Some(id) })
            }
        }
    }

    async fn delete_event(&self, id: RemoteId) -> Result<(), ApiError> {
        self.begin_call(format!("delete {}", id)).await?;

        let mut state = self.state.lock().unwrap();
        match state.events.remove(&id) {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(id.to_string())),
        }
    }
}
