//! Response cache
//!
//! Content-addressed memoization of completed chat requests. Keys are SHA-256
//! digests of the request, the connection (without credentials), the cache
//! namespace and [`CACHE_SCHEME_VERSION`].

use crate::models::chat::{CompletionRequest, CompletionResponse, FinishReason};
use crate::providers::ConnectionConfig;
use crate::utils::error::{AppError, AppResult, ErrorContext};
use crate::utils::hash::hash_value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, warn};

/// Bumped whenever the key derivation or entry layout changes
pub const CACHE_SCHEME_VERSION: u32 = 1;

/// Namespace used when caching is requested without a name
pub const DEFAULT_CACHE_NAME: &str = "chat";

/// Per-call cache selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Disabled,
    /// Default namespace
    Default,
    /// Named namespace
    Named(String),
}

impl CacheMode {
    /// Namespace to use, if caching is on
    pub fn namespace(&self) -> Option<&str> {
        match self {
            CacheMode::Disabled => None,
            CacheMode::Default => Some(DEFAULT_CACHE_NAME),
            CacheMode::Named(name) => Some(name.as_str()),
        }
    }
}

/// Stored cache value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub text: String,
    pub finish_reason: FinishReason,
    /// Scheme version the entry was written with
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl CachedCompletion {
    /// Entry for a finished response under the current scheme
    pub fn from_response(response: &CompletionResponse) -> Self {
        Self {
            text: response.text.clone(),
            finish_reason: response.finish_reason,
            version: CACHE_SCHEME_VERSION,
            created_at: Some(Utc::now()),
        }
    }
}

/// Cache key material.
///
/// Only the request and the connection fingerprint take part. Per-call
/// `CompletionOptions::headers` and credentials are transport metadata and
/// do not change the completion, so two calls differing only in them share
/// an entry.
#[derive(Debug, Clone, Serialize)]
pub struct CacheKey {
    version: u32,
    namespace: String,
    request: serde_json::Value,
    connection: serde_json::Value,
}

impl CacheKey {
    /// Build a key from every output-affecting input
    pub fn new(namespace: &str, request: &CompletionRequest, connection: &ConnectionConfig) -> AppResult<Self> {
        Ok(Self {
            version: CACHE_SCHEME_VERSION,
            namespace: namespace.to_string(),
            request: serde_json::to_value(request)?,
            connection: connection.fingerprint(),
        })
    }

    /// Hex SHA-256 digest
    pub fn sha(&self) -> String {
        hash_value(&serde_json::json!({
            "version": self.version,
            "namespace": self.namespace,
            "request": self.request,
            "connection": self.connection,
        }))
    }
}

/// Key/value backend of a [`ChatCache`]
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Store name, for traces
    fn name(&self) -> &str;

    /// Look up an entry by digest
    async fn get(&self, sha: &str) -> AppResult<Option<CachedCompletion>>;

    /// Insert or replace an entry
    async fn set(&self, sha: &str, value: CachedCompletion) -> AppResult<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    name: String,
    entries: DashMap<String, CachedCompletion>,
}

impl MemoryCacheStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), entries: DashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, sha: &str) -> AppResult<Option<CachedCompletion>> {
        Ok(self.entries.get(sha).map(|entry| entry.value().clone()))
    }

    async fn set(&self, sha: &str, value: CachedCompletion) -> AppResult<()> {
        self.entries.insert(sha.to_string(), value);
        Ok(())
    }
}

/// One line of a JSONL cache file
#[derive(Debug, Serialize, Deserialize)]
struct CacheLine {
    sha: String,
    val: CachedCompletion,
}

/// Append-only JSON-lines file store, loaded lazily on first access
#[derive(Debug)]
pub struct JsonlCacheStore {
    name: String,
    path: PathBuf,
    entries: DashMap<String, CachedCompletion>,
    loaded: OnceCell<()>,
    writer: Mutex<()>,
}

impl JsonlCacheStore {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            entries: DashMap::new(),
            loaded: OnceCell::new(),
            writer: Mutex::new(()),
        }
    }

    /// Store for `namespace` under `dir` (`<dir>/<namespace>.jsonl`)
    pub fn in_dir(dir: &Path, namespace: &str) -> Self {
        Self::new(namespace, dir.join(format!("{}.jsonl", namespace)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_loaded(&self) -> AppResult<()> {
        self.loaded
            .get_or_try_init(|| async {
                if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
                    debug!("Cache file {:?} does not exist yet", self.path);
                    return Ok(());
                }
                let content = tokio::fs::read_to_string(&self.path)
                    .await
                    .cache_context(&format!("Failed to read cache file {:?}", self.path))?;
                let mut skipped = 0;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<CacheLine>(line) {
                        // later lines win
                        Ok(entry) => {
                            self.entries.insert(entry.sha, entry.val);
                        }
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    warn!("Skipped {} malformed lines in {:?}", skipped, self.path);
                }
                debug!("Loaded {} cache entries from {:?}", self.entries.len(), self.path);
                Ok::<(), AppError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for JsonlCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, sha: &str) -> AppResult<Option<CachedCompletion>> {
        self.ensure_loaded().await?;
        Ok(self.entries.get(sha).map(|entry| entry.value().clone()))
    }

    async fn set(&self, sha: &str, value: CachedCompletion) -> AppResult<()> {
        self.ensure_loaded().await?;
        let mut line = serde_json::to_string(&CacheLine { sha: sha.to_string(), val: value.clone() })?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .cache_context(&format!("Failed to create cache directory {:?}", parent))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .cache_context(&format!("Failed to open cache file {:?}", self.path))?;
        file.write_all(line.as_bytes())
            .await
            .cache_context(&format!("Failed to append to cache file {:?}", self.path))?;
        file.flush().await.cache_context("Failed to flush cache file")?;

        self.entries.insert(sha.to_string(), value);
        Ok(())
    }
}

/// Chat completion cache over a [`CacheStore`].
///
/// Store failures never reach the caller: reads degrade to a miss and writes
/// are skipped, both with a warning.
#[derive(Clone)]
pub struct ChatCache {
    namespace: String,
    store: Arc<dyn CacheStore>,
}

impl std::fmt::Debug for ChatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCache")
            .field("namespace", &self.namespace)
            .field("store", &self.store.name())
            .finish()
    }
}

impl ChatCache {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        Self { namespace: namespace.into(), store }
    }

    /// In-memory cache
    pub fn memory(namespace: &str) -> Self {
        Self::new(namespace, Arc::new(MemoryCacheStore::new(namespace)))
    }

    /// JSONL-backed cache in `dir`
    pub fn jsonl(namespace: &str, dir: &Path) -> Self {
        Self::new(namespace, Arc::new(JsonlCacheStore::in_dir(dir, namespace)))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Key for a request in this namespace
    pub fn key(&self, request: &CompletionRequest, connection: &ConnectionConfig) -> AppResult<CacheKey> {
        CacheKey::new(&self.namespace, request, connection)
    }

    /// Digest of a key, for tracing
    pub fn key_sha(&self, key: &CacheKey) -> String {
        key.sha()
    }

    /// Cached entry for `key`; entries from another scheme version are misses
    pub async fn get(&self, key: &CacheKey) -> Option<CachedCompletion> {
        let sha = key.sha();
        match self.store.get(&sha).await {
            Ok(Some(entry)) if entry.version == CACHE_SCHEME_VERSION => Some(entry),
            Ok(Some(entry)) => {
                debug!("Ignoring cache entry {} with scheme version {}", sha, entry.version);
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed in '{}': {}", self.namespace, e);
                None
            }
        }
    }

    /// Store a response; only responses that finished with `stop` are kept.
    ///
    /// Returns whether the entry was written.
    pub async fn set(&self, key: &CacheKey, response: &CompletionResponse) -> bool {
        if response.finish_reason != FinishReason::Stop {
            debug!("Not caching response with finish reason {}", response.finish_reason);
            return false;
        }
        match self.store.set(&key.sha(), CachedCompletion::from_response(response)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache write failed in '{}': {}", self.namespace, e);
                false
            }
        }
    }
}
