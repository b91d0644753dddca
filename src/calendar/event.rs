use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const DEFAULT_TITLE_COLOR: &str = "#ffffff";

pub type RemoteId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub local_id: LocalId,
    #[serde(default, deserialize_with = "deserialize_remote_id")]
    pub id: Option<RemoteId>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "titleColor", default = "default_title_color")]
    pub title_color: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(title: impl Into<String>, start: DateTime<Utc>) -> Self {
        Self {
            local_id: LocalId::new(),
            id: None,
            title: title.into(),
            description: String::new(),
            title_color: default_title_color(),
            start,
            end: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_title_color(mut self, color: impl Into<String>) -> Self {
        self.title_color = color.into();
        self
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_remote_id(mut self, id: RemoteId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_draft(&self) -> bool {
        self.id.is_none()
    }

    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }

    pub fn effective_end(&self) -> DateTime<Utc> {
        self.end.unwrap_or(self.start)
    }
}

fn default_title_color() -> String {
    DEFAULT_TITLE_COLOR.to_string()
}

// The calendar server writes ids as numeric strings but reads them as integers.
pub(crate) fn deserialize_remote_id<'de, D>(deserializer: D) -> Result<Option<RemoteId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Int(i64),
        Text(String),
    }

    match Option::<RawId>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawId::Int(id)) => Ok(Some(id)),
        Some(RawId::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(RawId::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid event id '{}'", text))),
    }
}
