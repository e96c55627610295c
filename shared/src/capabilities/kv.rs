use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Mutex;
use thiserror::Error;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;
pub const MAX_PREFIX_LENGTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    #[must_use]
    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    #[must_use]
    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {MAX_KEY_LENGTH} bytes"),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.starts_with('/') || key.starts_with('\\') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with path separator".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.escape_default().to_string(),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Display for KvKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace.prefix(), self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    Collections,
    Settings,
    Custom(String),
}

impl KeyNamespace {
    #[must_use]
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::Collections => "collections",
            KeyNamespace::Settings => "settings",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, KvError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace exceeds maximum length of {MAX_PREFIX_LENGTH} bytes"
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KvError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },

    #[error("serialization error: {message}")]
    Serialization { message: String, key: Option<String> },
}

impl KvError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }

    fn serialization(e: &serde_json::Error, key: &KvKey) -> Self {
        Self::Serialization {
            message: e.to_string(),
            key: Some(key.raw()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageErrorCode::Busy | StorageErrorCode::Locked)
    }
}

/// Scoped persistent storage provided by the platform shell.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError>;
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// A JSON value living under one fixed key.
pub struct TypedKvStore<T> {
    key: KvKey,
    _phantom: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> TypedKvStore<T> {
    #[must_use]
    pub fn new(key: KvKey) -> Self {
        Self {
            key,
            _phantom: PhantomData,
        }
    }

    #[must_use]
    pub fn key(&self) -> &KvKey {
        &self.key
    }

    pub async fn load(&self, store: &dyn KeyValueStore) -> Result<Option<T>, KvError> {
        match store.get(&self.key).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| KvError::serialization(&e, &self.key)),
            None => Ok(None),
        }
    }

    pub async fn save(&self, store: &dyn KeyValueStore, value: &T) -> Result<(), KvError> {
        let data = serde_json::to_vec(value).map_err(|e| KvError::serialization(&e, &self.key))?;
        store.set(&self.key, data).await
    }
}

/// Process-local store, used by tests and by shells without durable storage.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))?;
        Ok(entries.get(&key.raw()).cloned())
    }

    async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
        check_value_size(&value)?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store poisoned"))?;
        entries.insert(key.raw(), value);
        Ok(())
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteKvStore;

#[cfg(not(target_arch = "wasm32"))]
mod sqlite {
    use super::{check_value_size, KeyValueStore, KvError, KvKey, StorageErrorCode};
    use async_trait::async_trait;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Single-file SQLite store; one row per key. Statements run on the
    /// blocking pool.
    pub struct SqliteKvStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteKvStore {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
            let conn = Connection::open(path).map_err(map_sqlite_error)?;
            Self::init(conn)
        }

        pub fn open_in_memory() -> Result<Self, KvError> {
            let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
            Self::init(conn)
        }

        fn init(conn: Connection) -> Result<Self, KvError> {
            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS kv_entries (
                    key TEXT PRIMARY KEY,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(map_sqlite_error)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        async fn with_conn<R, F>(&self, op: F) -> Result<R, KvError>
        where
            R: Send + 'static,
            F: FnOnce(&Connection) -> Result<R, KvError> + Send + 'static,
        {
            let conn = Arc::clone(&self.conn);
            tokio::task::spawn_blocking(move || {
                let conn = conn.lock().map_err(|_| {
                    KvError::storage(StorageErrorCode::Locked, "sqlite connection poisoned")
                })?;
                op(&conn)
            })
            .await
            .map_err(|e| KvError::storage(StorageErrorCode::Unknown, e.to_string()))?
        }
    }

    #[async_trait]
    impl KeyValueStore for SqliteKvStore {
        async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
            let key = key.raw();
            self.with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()
                .map_err(map_sqlite_error)
            })
            .await
        }

        async fn set(&self, key: &KvKey, value: Vec<u8>) -> Result<(), KvError> {
            check_value_size(&value)?;
            let key = key.raw();
            let now = i64::try_from(crate::get_current_time_ms()).unwrap_or(i64::MAX);
            self.with_conn(move |conn| {
                conn.execute(
                    r"
                    INSERT INTO kv_entries (key, value, updated_at)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at
                    ",
                    params![key, value, now],
                )
                .map_err(map_sqlite_error)?;
                Ok(())
            })
            .await
        }
    }

    fn map_sqlite_error(e: rusqlite::Error) -> KvError {
        let code = match &e {
            rusqlite::Error::SqliteFailure(err, _) => match err.code {
                rusqlite::ErrorCode::DatabaseBusy => StorageErrorCode::Busy,
                rusqlite::ErrorCode::DatabaseLocked => StorageErrorCode::Locked,
                rusqlite::ErrorCode::DiskFull => StorageErrorCode::DiskFull,
                rusqlite::ErrorCode::PermissionDenied | rusqlite::ErrorCode::ReadOnly => {
                    StorageErrorCode::PermissionDenied
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    StorageErrorCode::Corrupted
                }
                rusqlite::ErrorCode::SystemIoFailure | rusqlite::ErrorCode::CannotOpen => {
                    StorageErrorCode::IoError
                }
                _ => StorageErrorCode::Unknown,
            },
            _ => StorageErrorCode::Unknown,
        };
        KvError::storage(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_key_validation_empty() {
        let result = KvKey::new(KeyNamespace::Settings, "");
        assert!(matches!(result, Err(KvError::InvalidKey { .. })));
    }

    #[test]
    fn test_key_validation_whitespace() {
        assert!(KvKey::new(KeyNamespace::Settings, "   ").is_err());
    }

    #[test]
    fn test_key_validation_null_byte() {
        assert!(KvKey::new(KeyNamespace::Settings, "key\0value").is_err());
    }

    #[test]
    fn test_key_validation_path_traversal() {
        assert!(KvKey::new(KeyNamespace::Settings, "../etc/passwd").is_err());
    }

    #[test]
    fn test_key_validation_too_long() {
        let long_key = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(KvKey::new(KeyNamespace::Settings, long_key).is_err());
    }

    #[test]
    fn test_key_namespace_prefix() {
        let key = KvKey::new(KeyNamespace::Collections, "history").unwrap();
        assert_eq!(key.raw(), "collections:history");
    }

    #[test]
    fn test_custom_namespace() {
        assert_eq!(KeyNamespace::custom("myapp").unwrap().prefix(), "myapp");
        assert!(KeyNamespace::custom("").is_err());
        assert!(KeyNamespace::custom("invalid namespace!").is_err());
    }

    #[test]
    fn test_error_retryable() {
        assert!(KvError::storage(StorageErrorCode::Busy, "busy").is_retryable());
        assert!(!KvError::storage(StorageErrorCode::Corrupted, "bad").is_retryable());
        assert!(!KvError::ValueTooLarge { size: 2, max: 1 }.is_retryable());
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(KeyNamespace::Settings, "k").unwrap();

        assert_eq!(store.get(&key).await.unwrap(), None);
        store.set(&key, vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_rejects_oversized_values() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(KeyNamespace::Settings, "big").unwrap();
        let result = store.set(&key, vec![0u8; MAX_VALUE_SIZE + 1]).await;
        assert!(matches!(result, Err(KvError::ValueTooLarge { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn typed_store_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Marker {
            at: u64,
        }

        let store = MemoryKvStore::new();
        let typed: TypedKvStore<Marker> =
            TypedKvStore::new(KvKey::new(KeyNamespace::Settings, "marker").unwrap());

        assert_eq!(typed.load(&store).await.unwrap(), None);
        typed.save(&store, &Marker { at: 42 }).await.unwrap();
        assert_eq!(typed.load(&store).await.unwrap(), Some(Marker { at: 42 }));
    }

    #[tokio::test]
    async fn typed_store_reports_corrupt_values() {
        let store = MemoryKvStore::new();
        let key = KvKey::new(KeyNamespace::Settings, "marker").unwrap();
        store.set(&key, b"{not json".to_vec()).await.unwrap();

        let typed: TypedKvStore<u64> = TypedKvStore::new(key);
        assert!(matches!(
            typed.load(&store).await,
            Err(KvError::Serialization { key: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.sqlite");
        let key = KvKey::new(KeyNamespace::Collections, "saved").unwrap();

        {
            let store = SqliteKvStore::open(&path).unwrap();
            store.set(&key, b"first".to_vec()).await.unwrap();
            store.set(&key, b"second".to_vec()).await.unwrap();
        }

        let reopened = SqliteKvStore::open(&path).unwrap();
        assert_eq!(reopened.get(&key).await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sqlite_store_serves_concurrent_tasks() {
        let store = Arc::new(SqliteKvStore::open_in_memory().unwrap());

        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let key = KvKey::new(KeyNamespace::Settings, format!("k{i}")).unwrap();
                    store.set(&key, vec![i]).await.unwrap();
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap();
        }

        for i in 0..8u8 {
            let key = KvKey::new(KeyNamespace::Settings, format!("k{i}")).unwrap();
            assert_eq!(store.get(&key).await.unwrap(), Some(vec![i]));
        }
    }

    #[tokio::test]
    async fn sqlite_store_missing_key_is_none() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        let key = KvKey::new(KeyNamespace::Settings, "absent").unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
