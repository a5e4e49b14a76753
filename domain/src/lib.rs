use serde::{Deserialize, Deserializer, Serialize}; // For the index record wire format
use std::fmt;
use std::str::FromStr;
use thiserror::Error; // For domain-specific errors
use uuid::Uuid; // Random suffix for storage keys

// --- Domain Errors ---
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Invalid document: {0}")]
    InvalidDocument(String),
    #[error("Invalid key prefix: {0}")]
    InvalidKeyPrefix(String),
    #[error("Malformed index record: {0}")]
    MalformedIndex(String),
    #[error("Failed to encode index record: {0}")]
    IndexEncoding(String),
}

/// Prefix used when the host does not configure one.
pub const DEFAULT_KEY_PREFIX: &str = "DataProtection-Keys";

/// Appended to the key prefix to form the reserved index key.
/// Document keys always end in 32 hex characters, so the two never collide.
pub const INDEX_KEY_SUFFIX: &str = "__index";

// --- Document ---

/// An opaque XML element persisted by the repository.
///
/// The repository never interprets the element beyond checking that the text
/// looks like a single element. Whether its contents mean anything is the
/// caller's call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Document(String);

impl Document {
    /// Parses raw text into a document. Surrounding whitespace is dropped, the
    /// element itself is kept byte for byte.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, DomainError> {
        let text = raw.as_ref().trim();
        if text.is_empty() {
            return Err(DomainError::InvalidDocument(
                "Document text cannot be empty.".to_string(),
            ));
        }
        if !text.starts_with('<') || !text.ends_with('>') {
            return Err(DomainError::InvalidDocument(format!(
                "Expected a single XML element, got '{}'",
                preview(text)
            )));
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length of the serialized element in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Document {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Document> for String {
    fn from(document: Document) -> Self {
        document.0
    }
}

// Short excerpt for error messages; documents can be large.
fn preview(text: &str) -> String {
    const MAX_PREVIEW_CHARS: usize = 32;
    let mut excerpt: String = text.chars().take(MAX_PREVIEW_CHARS).collect();
    if text.chars().count() > MAX_PREVIEW_CHARS {
        excerpt.push_str("...");
    }
    excerpt
}

// --- Key Prefix ---

/// Stem shared by every document key of one repository. Also determines the
/// reserved index key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPrefix(String);

impl KeyPrefix {
    pub fn new(prefix: impl Into<String>) -> Result<Self, DomainError> {
        let prefix = prefix.into();
        if prefix.trim().is_empty() {
            return Err(DomainError::InvalidKeyPrefix(
                "Key prefix must be non-empty.".to_string(),
            ));
        }
        Ok(Self(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key under which the index record for this prefix is stored.
    pub fn index_key(&self) -> String {
        format!("{}{}", self.0, INDEX_KEY_SUFFIX)
    }
}

impl Default for KeyPrefix {
    fn default() -> Self {
        Self(DEFAULT_KEY_PREFIX.to_string())
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Storage Key ---

/// Key under which a single document is stored: `prefix + "_" + 32 hex chars`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// Generates a fresh key. Uniqueness rests on the 122 random bits of a v4
    /// UUID; existing keys are not consulted.
    pub fn generate(prefix: &KeyPrefix) -> Self {
        Self(format!("{}_{}", prefix.as_str(), Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StorageKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Index Record ---

/// Ordered list of every document key the repository has written.
///
/// Stored as JSON (`{"Keys": [...]}`) under the reserved index key. A null or
/// missing key list decodes as empty.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRecord {
    #[serde(rename = "Keys", default, deserialize_with = "null_as_empty")]
    keys: Vec<StorageKey>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<StorageKey>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<StorageKey>>::deserialize(deserializer)?.unwrap_or_default())
}

impl IndexRecord {
    /// Decodes the stored value. An absent or blank value is an empty index,
    /// anything else must be a well-formed record.
    pub fn decode(raw: Option<&str>) -> Result<Self, DomainError> {
        match raw {
            None => Ok(Self::default()),
            Some(text) if text.trim().is_empty() => Ok(Self::default()),
            Some(text) => serde_json::from_str(text)
                .map_err(|e| DomainError::MalformedIndex(e.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, DomainError> {
        serde_json::to_string(self).map_err(|e| DomainError::IndexEncoding(e.to_string()))
    }

    /// Appends a key at the end; index order is insertion order.
    pub fn append(&mut self, key: StorageKey) {
        self.keys.push(key);
    }

    pub fn keys(&self) -> &[StorageKey] {
        &self.keys
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
