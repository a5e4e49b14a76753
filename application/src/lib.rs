use async_trait::async_trait;
use domain::{Document, DomainError, IndexRecord, KeyPrefix, StorageKey};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

// --- State Store Errors ---

/// Failures reported by a [`StateStore`] backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateStoreError {
    #[error("State store '{store}' is unavailable: {reason}")]
    Unavailable { store: String, reason: String },
    #[error("State store rejected the operation on key '{key}': {reason}")]
    Rejected { key: String, reason: String },
    #[error("Unexpected state store response: {0}")]
    Protocol(String),
}

// --- Application Errors ---

/// Why a repository read could not complete.
///
/// All of these surface as [`ApplicationError::RepositoryRead`]; the variant
/// only tells the caller which step broke.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadFailure {
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
    #[error("value is listed in the index but absent from the state store")]
    MissingDocument,
    #[error("stored value could not be decoded: {0}")]
    Decode(#[source] DomainError),
}

/// Why a repository write could not complete.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriteFailure {
    #[error("state store error: {0}")]
    Store(#[from] StateStoreError),
    #[error("value could not be encoded: {0}")]
    Encode(#[source] DomainError),
    #[error("index record kept changing underneath the writer after {attempts} attempts")]
    IndexConflict { attempts: u32 },
}

#[derive(Error, Debug)]
pub enum ApplicationError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Failed to read '{key}' from the repository: {source}")]
    RepositoryRead { key: String, source: ReadFailure },
    #[error("Failed to write '{key}' to the repository: {source}")]
    RepositoryWrite { key: String, source: WriteFailure },
    #[error("Domain validation error: {0}")]
    DomainError(#[from] DomainError), // Propagate domain errors cleanly
}

// --- Infrastructure Interfaces (Traits) ---

/// Opaque version token handed out by stores that support compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ETag(String);

impl ETag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value together with its version token, if the backend has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: String,
    pub etag: Option<ETag>,
}

/// External key-value service addressed by `(store_name, key)`.
///
/// The repository does not own the connection behind an implementation; the
/// host shares it through an `Arc`. Timeouts and cancellation are the
/// backend's business and come back as [`StateStoreError`]s.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a value. Returns `Ok(None)` if the key has never been written.
    async fn get(&self, store_name: &str, key: &str) -> Result<Option<String>, StateStoreError>;

    /// Writes (creates or overwrites) a value.
    async fn put(&self, store_name: &str, key: &str, value: &str) -> Result<(), StateStoreError>;

    /// Reads a value along with its version token.
    ///
    /// Backends without versioning keep this default, which never returns a
    /// token.
    #[instrument(skip(self))]
    async fn get_with_etag(
        &self,
        store_name: &str,
        key: &str,
    ) -> Result<Option<Versioned>, StateStoreError> {
        debug!("Reading without version token via default implementation");
        Ok(self
            .get(store_name, key)
            .await?
            .map(|value| Versioned { value, etag: None }))
    }

    /// Writes a value only if the stored version still matches `expected`.
    /// `expected = None` means the caller saw no value.
    ///
    /// Returns `Ok(false)` when another writer got there first. The default
    /// cannot detect that and always writes.
    #[instrument(skip(self, value))]
    async fn try_put(
        &self,
        store_name: &str,
        key: &str,
        value: &str,
        expected: Option<&ETag>,
    ) -> Result<bool, StateStoreError> {
        debug!("Unconditional write via default implementation");
        self.put(store_name, key, value).await?;
        Ok(true)
    }
}

/// Append-only collection of documents that can be enumerated in full.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    /// Returns every stored document in insertion order, or an error. Never a
    /// partial set.
    async fn get_all_documents(&self) -> Result<Vec<Document>, ApplicationError>;

    /// Stores a document under a freshly generated key and returns that key.
    async fn store_document(&self, document: &Document) -> Result<StorageKey, ApplicationError>;

    /// Same as [`store_document`](Self::store_document). The friendly name is
    /// only logged; it plays no part in the storage key.
    #[instrument(skip(self, document))]
    async fn store_document_named(
        &self,
        document: &Document,
        friendly_name: &str,
    ) -> Result<StorageKey, ApplicationError> {
        debug!(friendly_name = %friendly_name, "Storing named document");
        self.store_document(document).await
    }
}

// --- Configuration ---

/// What a write does when the existing index cannot be decoded. Store
/// failures on that read are never covered by the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexCorruptPolicy {
    /// Log and carry on with an empty index. Previously indexed documents are
    /// no longer reachable after the write.
    #[default]
    Reset,
    /// Abort the write with a read error before touching the store.
    Fail,
}

impl FromStr for IndexCorruptPolicy {
    type Err = ApplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" => Ok(Self::Reset),
            "fail" => Ok(Self::Fail),
            other => Err(ApplicationError::InvalidArgument(format!(
                "Unknown index corruption policy '{}', expected 'reset' or 'fail'",
                other
            ))),
        }
    }
}

/// How concurrent writers are reconciled on the index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Plain read-modify-write. A concurrent writer's key can be lost.
    #[default]
    LastWriteWins,
    /// Compare-and-swap on the index using the store's version tokens,
    /// reloading and re-appending on conflict.
    Optimistic { max_attempts: u32 },
}

/// Attempts used when optimistic mode is selected by name.
pub const DEFAULT_OPTIMISTIC_ATTEMPTS: u32 = 5;

impl FromStr for ConcurrencyMode {
    type Err = ApplicationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "last-write-wins" => Ok(Self::LastWriteWins),
            "optimistic" => Ok(Self::Optimistic {
                max_attempts: DEFAULT_OPTIMISTIC_ATTEMPTS,
            }),
            other => Err(ApplicationError::InvalidArgument(format!(
                "Unknown index concurrency mode '{}', expected 'last-write-wins' or 'optimistic'",
                other
            ))),
        }
    }
}

/// Settings for an [`IndexedDocumentRepository`].
#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    /// Logical collection in the external store.
    pub store_name: String,
    /// Stem for document keys; also determines the index key.
    pub key_prefix: String,
    pub on_index_corrupt: IndexCorruptPolicy,
    pub concurrency: ConcurrencyMode,
}

impl RepositoryOptions {
    pub fn new(store_name: impl Into<String>) -> Self {
        Self {
            store_name: store_name.into(),
            key_prefix: domain::DEFAULT_KEY_PREFIX.to_string(),
            on_index_corrupt: IndexCorruptPolicy::default(),
            concurrency: ConcurrencyMode::default(),
        }
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn with_index_corrupt_policy(mut self, policy: IndexCorruptPolicy) -> Self {
        self.on_index_corrupt = policy;
        self
    }

    pub fn with_concurrency(mut self, mode: ConcurrencyMode) -> Self {
        self.concurrency = mode;
        self
    }
}

// --- Response Models (Data Transfer Objects - DTOs) ---

#[derive(Serialize, Debug)]
pub struct DocumentListResponse {
    pub documents: Vec<String>,
    pub count: usize,
}

impl From<Vec<Document>> for DocumentListResponse {
    fn from(documents: Vec<Document>) -> Self {
        let documents: Vec<String> = documents.into_iter().map(String::from).collect();
        Self {
            count: documents.len(),
            documents,
        }
    }
}

#[derive(Serialize, Debug)]
pub struct StoreDocumentResponse {
    pub key: String,
}

// --- Indexed Document Repository ---

/// Index contents plus the version token they were read at.
#[derive(Debug)]
struct IndexSnapshot {
    record: IndexRecord,
    etag: Option<ETag>,
}

/// Document repository over a [`StateStore`], keeping one index record that
/// lists every document key.
///
/// A store is a document write followed by an index write. The two are not
/// atomic: if the index write fails, the document stays in the store without
/// being listed (an orphan). Orphans are never cleaned up here.
pub struct IndexedDocumentRepository {
    state_store: Arc<dyn StateStore>,
    store_name: String,
    key_prefix: KeyPrefix,
    index_key: String,
    on_index_corrupt: IndexCorruptPolicy,
    concurrency: ConcurrencyMode,
}

impl IndexedDocumentRepository {
    pub fn new(
        state_store: Arc<dyn StateStore>,
        options: RepositoryOptions,
    ) -> Result<Self, ApplicationError> {
        if options.store_name.trim().is_empty() {
            return Err(ApplicationError::InvalidArgument(
                "Store name must be non-empty.".to_string(),
            ));
        }
        let key_prefix = KeyPrefix::new(options.key_prefix)
            .map_err(|e| ApplicationError::InvalidArgument(e.to_string()))?;
        if let ConcurrencyMode::Optimistic { max_attempts: 0 } = options.concurrency {
            return Err(ApplicationError::InvalidArgument(
                "Optimistic concurrency needs at least one attempt.".to_string(),
            ));
        }

        let index_key = key_prefix.index_key();
        info!(
            store = %options.store_name,
            prefix = %key_prefix,
            index_key = %index_key,
            policy = ?options.on_index_corrupt,
            concurrency = ?options.concurrency,
            "Indexed document repository configured"
        );
        Ok(Self {
            state_store,
            store_name: options.store_name,
            key_prefix,
            index_key,
            on_index_corrupt: options.on_index_corrupt,
            concurrency: options.concurrency,
        })
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    pub fn key_prefix(&self) -> &KeyPrefix {
        &self.key_prefix
    }

    pub fn index_key(&self) -> &str {
        &self.index_key
    }

    fn read_error(&self, key: &str, source: ReadFailure) -> ApplicationError {
        ApplicationError::RepositoryRead {
            key: key.to_string(),
            source,
        }
    }

    fn write_error(&self, key: &str, source: WriteFailure) -> ApplicationError {
        ApplicationError::RepositoryWrite {
            key: key.to_string(),
            source,
        }
    }

    /// Strict index read used by enumeration: every failure is fatal.
    async fn read_index(&self) -> Result<IndexRecord, ApplicationError> {
        let raw = self
            .state_store
            .get(&self.store_name, &self.index_key)
            .await
            .map_err(|e| self.read_error(&self.index_key, ReadFailure::Store(e)))?;
        IndexRecord::decode(raw.as_deref())
            .map_err(|e| self.read_error(&self.index_key, ReadFailure::Decode(e)))
    }

    /// Index read on the write path. Store failures always abort the write;
    /// only a value that cannot be decoded goes through the corruption policy.
    async fn load_index_for_update(&self) -> Result<IndexSnapshot, ApplicationError> {
        let fetched = match self.concurrency {
            ConcurrencyMode::LastWriteWins => self
                .state_store
                .get(&self.store_name, &self.index_key)
                .await
                .map(|raw| raw.map(|value| Versioned { value, etag: None })),
            ConcurrencyMode::Optimistic { .. } => {
                self.state_store
                    .get_with_etag(&self.store_name, &self.index_key)
                    .await
            }
        };

        let (raw, etag) = match fetched {
            Ok(Some(versioned)) => (Some(versioned.value), versioned.etag),
            Ok(None) => (None, None),
            Err(e) => {
                error!(
                    store = %self.store_name,
                    index_key = %self.index_key,
                    error = %e,
                    "Failed to read index record, refusing to write"
                );
                return Err(self.read_error(&self.index_key, ReadFailure::Store(e)));
            }
        };

        match IndexRecord::decode(raw.as_deref()) {
            Ok(record) => Ok(IndexSnapshot { record, etag }),
            Err(e) => self.recover_index(e, etag),
        }
    }

    fn recover_index(
        &self,
        failure: DomainError,
        etag: Option<ETag>,
    ) -> Result<IndexSnapshot, ApplicationError> {
        match self.on_index_corrupt {
            IndexCorruptPolicy::Reset => {
                warn!(
                    store = %self.store_name,
                    index_key = %self.index_key,
                    error = %failure,
                    "Index record malformed, continuing with an empty index"
                );
                Ok(IndexSnapshot {
                    record: IndexRecord::default(),
                    etag,
                })
            }
            IndexCorruptPolicy::Fail => {
                error!(
                    store = %self.store_name,
                    index_key = %self.index_key,
                    error = %failure,
                    "Index record malformed, refusing to write"
                );
                Err(self.read_error(&self.index_key, ReadFailure::Decode(failure)))
            }
        }
    }

    fn encode_index(&self, record: &IndexRecord) -> Result<String, ApplicationError> {
        record
            .encode()
            .map_err(|e| self.write_error(&self.index_key, WriteFailure::Encode(e)))
    }

    fn orphaned(&self, key: &StorageKey, source: WriteFailure) -> ApplicationError {
        error!(
            store = %self.store_name,
            key = %key,
            error = %source,
            "Index write failed, document is stored but unreferenced"
        );
        self.write_error(&self.index_key, source)
    }

    async fn commit_index(
        &self,
        mut record: IndexRecord,
        key: &StorageKey,
    ) -> Result<(), ApplicationError> {
        record.append(key.clone());
        let encoded = self.encode_index(&record)?;
        self.state_store
            .put(&self.store_name, &self.index_key, &encoded)
            .await
            .map_err(|e| self.orphaned(key, WriteFailure::Store(e)))
    }

    async fn commit_index_optimistic(
        &self,
        mut snapshot: IndexSnapshot,
        key: &StorageKey,
        max_attempts: u32,
    ) -> Result<(), ApplicationError> {
        let mut attempt = 1;
        loop {
            let IndexSnapshot { mut record, etag } = snapshot;
            record.append(key.clone());
            let encoded = self.encode_index(&record)?;
            let written = self
                .state_store
                .try_put(&self.store_name, &self.index_key, &encoded, etag.as_ref())
                .await
                .map_err(|e| self.orphaned(key, WriteFailure::Store(e)))?;
            if written {
                debug!(attempt, "Index record swapped");
                return Ok(());
            }
            if attempt >= max_attempts {
                return Err(self.orphaned(
                    key,
                    WriteFailure::IndexConflict {
                        attempts: max_attempts,
                    },
                ));
            }
            warn!(
                store = %self.store_name,
                attempt,
                "Index record changed concurrently, reloading"
            );
            attempt += 1;
            snapshot = self.load_index_for_update().await.inspect_err(|_| {
                error!(
                    store = %self.store_name,
                    key = %key,
                    "Index reload failed, document is stored but unreferenced"
                );
            })?;
        }
    }
}

#[async_trait]
impl DocumentRepository for IndexedDocumentRepository {
    #[instrument(skip(self))]
    async fn get_all_documents(&self) -> Result<Vec<Document>, ApplicationError> {
        debug!(store = %self.store_name, "Enumerating documents");
        // Any unreadable entry fails the whole call: callers make security
        // decisions from the full set (e.g. key revocations).
        let index = self.read_index().await.inspect_err(|e| {
            error!(store = %self.store_name, "Failed to read index record: {}", e);
        })?;

        let mut documents = Vec::with_capacity(index.len());
        for key in index.keys() {
            let raw = self
                .state_store
                .get(&self.store_name, key.as_str())
                .await
                .map_err(|e| self.read_error(key.as_str(), ReadFailure::Store(e)))?
                .ok_or_else(|| self.read_error(key.as_str(), ReadFailure::MissingDocument))?;
            let document = Document::parse(&raw)
                .map_err(|e| self.read_error(key.as_str(), ReadFailure::Decode(e)))?;
            documents.push(document);
        }

        debug!(store = %self.store_name, count = documents.len(), "Documents enumerated");
        Ok(documents)
    }

    #[instrument(skip(self, document))]
    async fn store_document(&self, document: &Document) -> Result<StorageKey, ApplicationError> {
        let snapshot = self.load_index_for_update().await?;

        let key = StorageKey::generate(&self.key_prefix);
        debug!(store = %self.store_name, key = %key, bytes = document.len(), "Writing document");
        self.state_store
            .put(&self.store_name, key.as_str(), document.as_str())
            .await
            .map_err(|e| {
                error!(store = %self.store_name, key = %key, "Document write failed: {}", e);
                self.write_error(key.as_str(), WriteFailure::Store(e))
            })?;

        match self.concurrency {
            ConcurrencyMode::LastWriteWins => self.commit_index(snapshot.record, &key).await?,
            ConcurrencyMode::Optimistic { max_attempts } => {
                self.commit_index_optimistic(snapshot, &key, max_attempts)
                    .await?
            }
        }

        info!(store = %self.store_name, key = %key, "Document stored");
        Ok(key)
    }
}
