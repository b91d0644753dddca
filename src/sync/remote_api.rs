use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::event::deserialize_remote_id;
use crate::calendar::{Event, RemoteId};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Remote store rejected the request: {0}")]
    Rejected(String),
    #[error("Event not found: {0}")]
    NotFound(String),
    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveAck {
    pub id: Option<RemoteId>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventApi: Send + Sync {
    async fn fetch_events(&self) -> Result<Vec<Event>, ApiError>;

    async fn save_event(&self, event: &Event) -> Result<SaveAck, ApiError>;

    async fn delete_event(&self, id: RemoteId) -> Result<(), ApiError>;
}

#[derive(Debug, Serialize)]
struct EventBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RemoteId>,
    title: &'a str,
    description: &'a str,
    #[serde(rename = "titleColor")]
    title_color: &'a str,
    start: String,
    end: Option<String>,
}

impl<'a> From<&'a Event> for EventBody<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            id: event.id,
            title: &event.title,
            description: &event.description,
            title_color: &event.title_color,
            start: event.start.to_rfc3339(),
            end: event.end.map(|end| end.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
struct DeleteBody {
    id: RemoteId,
}

#[derive(Debug, Deserialize)]
struct MutationResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, deserialize_with = "deserialize_remote_id")]
    id: Option<RemoteId>,
    error: Option<String>,
}

pub struct HttpEventApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpEventApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn post_mutation<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        subject: String,
    ) -> Result<MutationResponse, ApiError> {
        let url = format!("{}{}", self.base_url, path);

        let response = self.client.post(&url).json(body).send().await?;

        let status = response.status();
        tracing::debug!("POST {} response status: {}", url, status);

        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound(subject));
        }

        let text = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: MutationResponse =
            serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))?;

        if !parsed.success {
            return Err(ApiError::Rejected(
                parsed.error.clone().unwrap_or_else(|| "no reason given".to_string()),
            ));
        }

        Ok(parsed)
    }
}

#[async_trait]
impl EventApi for HttpEventApi {
    async fn fetch_events(&self) -> Result<Vec<Event>, ApiError> {
        let url = format!("{}/get_events", self.base_url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::error!("Failed to fetch events. Status: {}, Body: {}", status, text);
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let raw: Vec<serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| ApiError::Malformed(e.to_string()))?;

        let events: Vec<Event> = raw
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Event>(value) {
                Ok(event) if event.id.is_some() => Some(event),
                Ok(_) => {
                    tracing::warn!("Ignoring remote event without id");
                    None
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed remote event: {}", e);
                    None
                }
            })
            .collect();

        tracing::info!("Fetched {} events", events.len());
        Ok(events)
    }

    async fn save_event(&self, event: &Event) -> Result<SaveAck, ApiError> {
        let subject = event
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| event.local_id.to_string());

        let response = self
            .post_mutation("/save_event", &EventBody::from(event), subject)
            .await?;

        if event.id.is_none() && response.id.is_none() {
            return Err(ApiError::Malformed("create acknowledged without an id".to_string()));
        }

        Ok(SaveAck { id: response.id })
    }

    async fn delete_event(&self, id: RemoteId) -> Result<(), ApiError> {
        self.post_mutation("/delete_event", &DeleteBody { id }, id.to_string())
            .await?;
        Ok(())
    }
}
