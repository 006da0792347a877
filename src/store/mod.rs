//! Path-addressed object store.
//!
//! Every blob the pipeline persists (extraction trees, corrections,
//! aggregated results) lives under a key derived from
//! `(document, execution, stage)`, so concurrent writers from retries or
//! duplicate deliveries land on the same key with the same content.
//! `put_if_absent` is the first-writer-wins primitive.

pub mod fs;
pub mod layout;

pub use fs::FsObjectStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error for {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Blob store contract. Keys are `/`-separated relative paths.
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Write only when the key does not exist yet. Returns `false`
    /// (without writing) when another writer got there first.
    fn put_if_absent(&self, key: &str, bytes: &[u8]) -> Result<bool, StoreError>;

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys under a prefix, sorted. The intake watcher's listing
    /// primitive.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Serialize and store a value as pretty JSON.
pub fn put_json<T: Serialize>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = to_json_bytes(key, value)?;
    store.put(key, &bytes)
}

/// First-writer-wins variant of [`put_json`].
pub fn put_json_if_absent<T: Serialize>(
    store: &dyn ObjectStore,
    key: &str,
    value: &T,
) -> Result<bool, StoreError> {
    let bytes = to_json_bytes(key, value)?;
    store.put_if_absent(key, &bytes)
}

/// Load and deserialize a JSON object.
pub fn get_json<T: DeserializeOwned>(store: &dyn ObjectStore, key: &str) -> Result<T, StoreError> {
    let bytes = store.get(key)?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })
}

fn to_json_bytes<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        key: key.to_string(),
        source,
    })
}
