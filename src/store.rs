//! Flat-file persistence: one JSON array per resource.
//!
//! Every operation reads or rewrites a whole array. There is no cache and no
//! locking across requests, so two writers racing on the same resource can
//! lose an update.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// The five collections served by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Articles,
    RssFeeds,
    Services,
    SpecialOffers,
    FeatureToggles,
}

/// How a record is addressed by the `:id` path segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    /// Zero-based array index at request time.
    Position,
    /// String equality against the named field.
    Field(&'static str),
}

impl Resource {
    pub const ALL: [Resource; 5] = [
        Resource::Articles,
        Resource::RssFeeds,
        Resource::Services,
        Resource::SpecialOffers,
        Resource::FeatureToggles,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Resource::Articles => "articles",
            Resource::RssFeeds => "rss-feeds",
            Resource::Services => "services",
            Resource::SpecialOffers => "special-offers",
            Resource::FeatureToggles => "feature-toggles",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.json", self.slug())
    }

    /// Human-readable name used in response messages.
    pub fn label(self) -> &'static str {
        match self {
            Resource::Articles => "Article",
            Resource::RssFeeds => "RSS feed",
            Resource::Services => "Service",
            Resource::SpecialOffers => "Special offer",
            Resource::FeatureToggles => "Feature toggle",
        }
    }

    /// Plural form used in error messages ("Failed to read services").
    pub fn plural(self) -> &'static str {
        match self {
            Resource::Articles => "articles",
            Resource::RssFeeds => "RSS feeds",
            Resource::Services => "services",
            Resource::SpecialOffers => "special offers",
            Resource::FeatureToggles => "feature toggles",
        }
    }

    pub fn identity(self) -> Identity {
        match self {
            Resource::FeatureToggles => Identity::Field("id"),
            _ => Identity::Position,
        }
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{resource} data is missing or corrupt: {reason}")]
    NotFoundOrCorrupt { resource: Resource, reason: String },
    #[error("I/O error on {resource} data: {source}")]
    Io {
        resource: Resource,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {resource} data: {source}")]
    Encode {
        resource: Resource,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait CollectionStore: Send + Sync + 'static {
    async fn load(&self, resource: Resource) -> Result<Vec<Value>, StoreError>;
    async fn save(&self, resource: Resource, records: &[Value]) -> Result<(), StoreError>;
}

/// Parse raw file content, requiring a top-level JSON array.
fn decode_records(resource: Resource, bytes: &[u8]) -> Result<Vec<Value>, StoreError> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Array(records)) => Ok(records),
        Ok(other) => Err(StoreError::NotFoundOrCorrupt {
            resource,
            reason: format!("expected a JSON array, found {}", json_kind(&other)),
        }),
        Err(e) => Err(StoreError::NotFoundOrCorrupt {
            resource,
            reason: e.to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, resource: Resource) -> PathBuf {
        self.dir.join(resource.file_name())
    }

    /// Create the data directory and seed every missing resource file with
    /// an empty array. Existing files are left untouched.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        for resource in Resource::ALL {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|source| StoreError::Io { resource, source })?;

            let path = self.path_for(resource);
            match tokio::fs::metadata(&path).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    info!("Seeding empty {} at {}", resource, path.display());
                    tokio::fs::write(&path, b"[]")
                        .await
                        .map_err(|source| StoreError::Io { resource, source })?;
                }
                Err(source) => return Err(StoreError::Io { resource, source }),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CollectionStore for JsonFileStore {
    async fn load(&self, resource: Resource) -> Result<Vec<Value>, StoreError> {
        let path = self.path_for(resource);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFoundOrCorrupt {
                    resource,
                    reason: format!("{} does not exist", path.display()),
                })
            }
            Err(source) => return Err(StoreError::Io { resource, source }),
        };
        decode_records(resource, &bytes)
    }

    async fn save(&self, resource: Resource, records: &[Value]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(records)
            .map_err(|source| StoreError::Encode { resource, source })?;
        let path = self.path_for(resource);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| StoreError::Io { resource, source })?;
        debug!("Wrote {} {} records to {}", records.len(), resource, path.display());
        Ok(())
    }
}

/// Store backed by a map instead of files. Every resource starts as an
/// empty array.
pub struct MemoryStore {
    collections: RwLock<HashMap<Resource, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let collections = Resource::ALL
            .into_iter()
            .map(|resource| (resource, Vec::new()))
            .collect();
        Self {
            collections: RwLock::new(collections),
        }
    }

    pub fn with_records(mut self, resource: Resource, records: Vec<Value>) -> Self {
        self.collections.get_mut().insert(resource, records);
        self
    }

    /// Drop a resource so the next `load` fails as if its file were missing.
    pub async fn forget(&self, resource: Resource) {
        self.collections.write().await.remove(&resource);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CollectionStore for MemoryStore {
    async fn load(&self, resource: Resource) -> Result<Vec<Value>, StoreError> {
        self.collections
            .read()
            .await
            .get(&resource)
            .cloned()
            .ok_or_else(|| StoreError::NotFoundOrCorrupt {
                resource,
                reason: "no such collection".to_string(),
            })
    }

    async fn save(&self, resource: Resource, records: &[Value]) -> Result<(), StoreError> {
        self.collections
            .write()
            .await
            .insert(resource, records.to_vec());
        Ok(())
    }
}
