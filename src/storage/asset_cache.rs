use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CACHE_VERSION: &str = "calendar-cache-v1";

pub const SHELL_RESOURCES: &[&str] = &[
    "/",
    "/calendar",
    "/login",
    "/signup",
    "/static/manifest.json",
    "/static/calendar.js",
    "/static/calendar.css",
    "/static/calendar.html",
    "/static/service-worker.js",
    "/static/icons/icon-192x192.png",
    "/static/icons/icon-512x512.png",
    "https://cdn.jsdelivr.net/npm/fullcalendar@5.11.0/main.min.css",
    "https://cdn.jsdelivr.net/npm/fullcalendar@5.11.0/main.min.js",
    "https://code.jquery.com/jquery-3.6.0.min.js",
];

#[derive(Debug, Error)]
pub enum AssetCacheError {
    #[error("Cache install incomplete, {url} could not be fetched: {reason}")]
    InstallIncomplete { url: String, reason: String },
    #[error("Fetch of {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
    #[error("Cache worker failed: {0}")]
    WorkerFailed(String),
    #[error("Failed to prepare cache directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: String,
    pub resources: Vec<String>,
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            resources: SHELL_RESOURCES.iter().map(|r| r.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Asset {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Asset, AssetCacheError>;
}

pub struct HttpAssetFetcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAssetFetcher {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(&self, url: &str) -> Result<Asset, AssetCacheError> {
        let failed = |e: reqwest::Error| AssetCacheError::FetchFailed {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self.client.get(self.resolve(url)).send().await.map_err(failed)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(failed)?.to_vec();

        Ok(Asset {
            url: url.to_string(),
            status,
            content_type,
            body,
        })
    }
}

#[derive(Clone)]
pub struct AssetCache {
    conn: Arc<Mutex<Connection>>,
    manifest: AssetManifest,
}

impl AssetCache {
    pub fn new(conn: Connection, manifest: AssetManifest) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            manifest,
        }
    }

    pub fn open(path: &Path, manifest: AssetManifest) -> Result<Self, AssetCacheError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cache = Self::new(Connection::open(path)?, manifest);
        cache.initialize()?;
        Ok(cache)
    }

    pub fn initialize(&self) -> Result<(), AssetCacheError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| AssetCacheError::WorkerFailed("connection lock poisoned".to_string()))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS asset_cache (
                bucket TEXT NOT NULL,
                url TEXT NOT NULL,
                status INTEGER NOT NULL,
                content_type TEXT,
                body BLOB NOT NULL,
                cached_at TEXT NOT NULL,
                PRIMARY KEY (bucket, url)
            )",
            [],
        )?;
        Ok(())
    }

    pub fn version(&self) -> &str {
        &self.manifest.version
    }

    /// Fetches every shell resource, then writes the bucket in one
    /// transaction. Nothing is written unless every fetch succeeded.
    pub async fn install(&self, fetcher: &dyn AssetFetcher) -> Result<usize, AssetCacheError> {
        tracing::info!(
            "Installing asset cache {} ({} resources)",
            self.manifest.version,
            self.manifest.resources.len()
        );

        let mut assets = Vec::with_capacity(self.manifest.resources.len());
        for url in &self.manifest.resources {
            let asset = fetcher.fetch(url).await.map_err(|e| {
                tracing::error!("Asset cache install aborted at {}: {}", url, e);
                AssetCacheError::InstallIncomplete {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            })?;
            if !asset.is_success() {
                tracing::error!("Asset cache install aborted at {}: status {}", url, asset.status);
                return Err(AssetCacheError::InstallIncomplete {
                    url: url.clone(),
                    reason: format!("status {}", asset.status),
                });
            }
            assets.push(asset);
        }

        let bucket = self.manifest.version.clone();
        let count = assets.len();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM asset_cache WHERE bucket = ?1", [&bucket])?;
            let cached_at = Utc::now().to_rfc3339();
            for asset in &assets {
                tx.execute(
                    "INSERT INTO asset_cache (bucket, url, status, content_type, body, cached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        &bucket,
                        &asset.url,
                        asset.status,
                        &asset.content_type,
                        &asset.body,
                        &cached_at,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        tracing::info!("Asset cache {} installed", self.manifest.version);
        Ok(count)
    }

    pub async fn activate(&self) -> Result<Vec<String>, AssetCacheError> {
        let current = self.manifest.version.clone();
        let stale: Vec<String> = self
            .bucket_names()
            .await?
            .into_iter()
            .filter(|name| *name != current)
            .collect();

        let to_delete = stale.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for bucket in &to_delete {
                tx.execute("DELETE FROM asset_cache WHERE bucket = ?1", [bucket])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        for bucket in &stale {
            tracing::info!("Deleted stale asset cache {}", bucket);
        }
        Ok(stale)
    }

    pub async fn fetch(&self, fetcher: &dyn AssetFetcher, url: &str) -> Result<Asset, AssetCacheError> {
        if let Some(asset) = self.cached(url).await? {
            tracing::debug!("Serving {} from cache", url);
            return Ok(asset);
        }
        tracing::debug!("{} not cached, fetching from network", url);
        fetcher.fetch(url).await
    }

    pub async fn cached(&self, url: &str) -> Result<Option<Asset>, AssetCacheError> {
        let url = url.to_string();
        let current = self.manifest.version.clone();
        self.with_conn(move |conn| {
            let asset = conn
                .query_row(
                    "SELECT url, status, content_type, body FROM asset_cache
                     WHERE url = ?1 ORDER BY (bucket = ?2) DESC LIMIT 1",
                    [&url, &current],
                    |row| {
                        Ok(Asset {
                            url: row.get(0)?,
                            status: row.get(1)?,
                            content_type: row.get(2)?,
                            body: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(asset)
        })
        .await
    }

    pub async fn bucket_names(&self) -> Result<Vec<String>, AssetCacheError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT DISTINCT bucket FROM asset_cache ORDER BY bucket")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, AssetCacheError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, AssetCacheError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| AssetCacheError::WorkerFailed("connection lock poisoned".to_string()))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| AssetCacheError::WorkerFailed(e.to_string()))?
    }
}
