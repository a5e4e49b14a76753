// ./infrastructure/src/persistence/in_memory_state_store.rs
use application::{ETag, StateStore, StateStoreError, Versioned};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A value plus the version counter its ETag is derived from.
#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    version: u64,
}

impl StoredValue {
    fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            version: 1,
        }
    }

    fn etag(&self) -> ETag {
        ETag::new(self.version.to_string())
    }

    fn replace(&mut self, value: &str) {
        self.value = value.to_string();
        self.version += 1;
    }
}

/// State store held in process memory. Supports version tokens, so it can
/// back the optimistic index mode. Cloning shares the underlying maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    // Store Name -> (Key -> Value)
    stores: Arc<DashMap<String, DashMap<String, StoredValue>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            stores: Arc::new(DashMap::new()),
        }
    }

    /// Number of keys held for `store_name`, including the index record.
    pub fn len(&self, store_name: &str) -> usize {
        self.stores.get(store_name).map_or(0, |store| store.len())
    }

    pub fn is_empty(&self, store_name: &str) -> bool {
        self.len(store_name) == 0
    }

    /// All keys held for `store_name`, sorted.
    pub fn keys(&self, store_name: &str) -> Vec<String> {
        let mut keys: Vec<String> = match self.stores.get(store_name) {
            Some(store) => store.iter().map(|entry| entry.key().clone()).collect(),
            None => Vec::new(),
        };
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    #[instrument(skip(self))]
    async fn get(&self, store_name: &str, key: &str) -> Result<Option<String>, StateStoreError> {
        debug!("Getting value from in-memory state store");
        if let Some(store) = self.stores.get(store_name) {
            let value = store.get(key).map(|stored| stored.value.clone());
            Ok(value)
        } else {
            Ok(None) // Store has never been written to
        }
    }

    #[instrument(skip(self, value))]
    async fn put(&self, store_name: &str, key: &str, value: &str) -> Result<(), StateStoreError> {
        debug!(bytes = value.len(), "Putting value into in-memory state store");
        // Get or create the inner map for the store
        let store = self
            .stores
            .entry(store_name.to_string())
            .or_insert_with(DashMap::new);
        store
            .entry(key.to_string())
            .and_modify(|stored| stored.replace(value))
            .or_insert_with(|| StoredValue::new(value));
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_with_etag(
        &self,
        store_name: &str,
        key: &str,
    ) -> Result<Option<Versioned>, StateStoreError> {
        debug!("Getting versioned value from in-memory state store");
        if let Some(store) = self.stores.get(store_name) {
            let versioned = store.get(key).map(|stored| Versioned {
                value: stored.value.clone(),
                etag: Some(stored.etag()),
            });
            Ok(versioned)
        } else {
            Ok(None)
        }
    }

    #[instrument(skip(self, value))]
    async fn try_put(
        &self,
        store_name: &str,
        key: &str,
        value: &str,
        expected: Option<&ETag>,
    ) -> Result<bool, StateStoreError> {
        let store = self
            .stores
            .entry(store_name.to_string())
            .or_insert_with(DashMap::new);
        // The entry guard holds the shard lock, so compare and swap happen together.
        let swapped = match store.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get().etag();
                if expected == Some(&current) {
                    occupied.get_mut().replace(value);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(StoredValue::new(value));
                    true
                } else {
                    false
                }
            }
        };
        debug!(swapped, "Conditional put on in-memory state store");
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use application::{
        ConcurrencyMode, DocumentRepository, IndexedDocumentRepository, RepositoryOptions,
    };
    use domain::Document;

    const STORE: &str = "protection-keys";

    fn doc(raw: &str) -> Document {
        Document::parse(raw).expect("valid document")
    }

    #[tokio::test]
    async fn put_then_get_returns_latest_value() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.get(STORE, "k").await.unwrap(), None);

        store.put(STORE, "k", "one").await.unwrap();
        store.put(STORE, "k", "two").await.unwrap();

        assert_eq!(store.get(STORE, "k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(STORE), 1);
    }

    #[tokio::test]
    async fn store_names_are_isolated() {
        let store = InMemoryStateStore::new();
        store.put("left", "k", "v").await.unwrap();

        assert_eq!(store.get("right", "k").await.unwrap(), None);
        assert!(store.is_empty("right"));
        assert_eq!(store.keys("left"), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn etag_changes_on_every_write() {
        let store = InMemoryStateStore::new();
        store.put(STORE, "k", "one").await.unwrap();
        let first = store.get_with_etag(STORE, "k").await.unwrap().unwrap();

        store.put(STORE, "k", "two").await.unwrap();
        let second = store.get_with_etag(STORE, "k").await.unwrap().unwrap();

        assert_eq!(second.value, "two");
        assert_ne!(first.etag, second.etag);
    }

    #[tokio::test]
    async fn try_put_swaps_only_on_matching_etag() {
        let store = InMemoryStateStore::new();
        assert!(store.try_put(STORE, "k", "one", None).await.unwrap());
        // Key exists now, so "expected absent" no longer holds.
        assert!(!store.try_put(STORE, "k", "clobber", None).await.unwrap());

        let current = store.get_with_etag(STORE, "k").await.unwrap().unwrap();
        let stale = ETag::new("0");
        assert!(!store.try_put(STORE, "k", "stale", Some(&stale)).await.unwrap());
        assert!(store
            .try_put(STORE, "k", "two", current.etag.as_ref())
            .await
            .unwrap());

        assert_eq!(store.get(STORE, "k").await.unwrap().as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn try_put_with_etag_on_missing_key_fails() {
        let store = InMemoryStateStore::new();
        let etag = ETag::new("1");
        assert!(!store.try_put(STORE, "k", "v", Some(&etag)).await.unwrap());
        assert!(store.is_empty(STORE));
    }

    #[tokio::test]
    async fn repository_round_trip_over_in_memory_store() {
        let store = Arc::new(InMemoryStateStore::new());
        let repo = IndexedDocumentRepository::new(
            store.clone(),
            RepositoryOptions::new(STORE).with_key_prefix("DataProtection-Keys"),
        )
        .unwrap();

        let a = repo.store_document(&doc("<key id=\"A\"/>")).await.unwrap();
        let b = repo.store_document(&doc("<key id=\"B\"/>")).await.unwrap();

        let documents = repo.get_all_documents().await.unwrap();
        let texts: Vec<&str> = documents.iter().map(Document::as_str).collect();
        assert_eq!(texts, vec!["<key id=\"A\"/>", "<key id=\"B\"/>"]);

        // Two documents plus the index, nothing else.
        let mut expected = vec![
            a.to_string(),
            b.to_string(),
            "DataProtection-Keys__index".to_string(),
        ];
        expected.sort();
        assert_eq!(store.keys(STORE), expected);
    }

    #[tokio::test]
    async fn repositories_with_different_prefixes_share_a_store() {
        let store = Arc::new(InMemoryStateStore::new());
        let keys = IndexedDocumentRepository::new(
            store.clone(),
            RepositoryOptions::new(STORE).with_key_prefix("Keys"),
        )
        .unwrap();
        let certs = IndexedDocumentRepository::new(
            store.clone(),
            RepositoryOptions::new(STORE).with_key_prefix("Certs"),
        )
        .unwrap();

        keys.store_document(&doc("<key/>")).await.unwrap();
        certs.store_document(&doc("<cert/>")).await.unwrap();

        assert_eq!(keys.get_all_documents().await.unwrap(), vec![doc("<key/>")]);
        assert_eq!(certs.get_all_documents().await.unwrap(), vec![doc("<cert/>")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn optimistic_writers_do_not_lose_index_entries() {
        const WRITERS: usize = 8;
        let store = Arc::new(InMemoryStateStore::new());
        let repo = Arc::new(
            IndexedDocumentRepository::new(
                store.clone(),
                RepositoryOptions::new(STORE).with_concurrency(ConcurrencyMode::Optimistic {
                    // A writer only loses a swap when another one wins, so this
                    // many attempts always suffices.
                    max_attempts: WRITERS as u32,
                }),
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..WRITERS {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                repo.store_document(&doc(&format!("<key id=\"{}\"/>", i)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let documents = repo.get_all_documents().await.unwrap();
        assert_eq!(documents.len(), WRITERS);
        assert_eq!(store.len(STORE), WRITERS + 1);
    }
}
