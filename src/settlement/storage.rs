use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// Independent logical keyspaces. No operation spans two of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyspace {
    Accounts,
    WorkCache,
    PendingTxs,
    Usernames,
    Metadata,
}

impl Keyspace {
    fn name(&self) -> &'static str {
        match self {
            Keyspace::Accounts => "accounts",
            Keyspace::WorkCache => "work_cache",
            Keyspace::PendingTxs => "pending_txs",
            Keyspace::Usernames => "usernames",
            Keyspace::Metadata => "metadata",
        }
    }
}

/// Converts the not-found case of a storage lookup into `None`.
pub trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>, StorageError>;
}

impl<T> OptionalExt<T> for Result<T, StorageError> {
    fn optional(self) -> Result<Option<T>, StorageError> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Key-value storage backing the registry, work cache, pending log and username map
pub struct Storage {
    /// The database instance
    db: Db,

    /// Tree for accounts, indexed by user id and by address
    accounts: Tree,

    /// Tree for cached proof-of-work
    work_cache: Tree,

    /// Tree for transfers awaiting confirmation
    pending_txs: Tree,

    /// Tree for username <-> user id mappings
    usernames: Tree,

    /// Tree for metadata (seed index counter)
    metadata: Tree,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .finish()
    }
}

impl Storage {
    /// Opens the storage at the given directory
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens a throwaway storage that is removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let accounts = db.open_tree(Keyspace::Accounts.name())?;
        let work_cache = db.open_tree(Keyspace::WorkCache.name())?;
        let pending_txs = db.open_tree(Keyspace::PendingTxs.name())?;
        let usernames = db.open_tree(Keyspace::Usernames.name())?;
        let metadata = db.open_tree(Keyspace::Metadata.name())?;

        Ok(Self {
            db,
            accounts,
            work_cache,
            pending_txs,
            usernames,
            metadata,
        })
    }

    fn tree(&self, keyspace: Keyspace) -> &Tree {
        match keyspace {
            Keyspace::Accounts => &self.accounts,
            Keyspace::WorkCache => &self.work_cache,
            Keyspace::PendingTxs => &self.pending_txs,
            Keyspace::Usernames => &self.usernames,
            Keyspace::Metadata => &self.metadata,
        }
    }

    /// Gets a value by key
    ///
    /// # Returns
    ///
    /// The value, or `StorageError::NotFound` if the key is absent
    pub fn get<T: DeserializeOwned>(&self, keyspace: Keyspace, key: &str) -> Result<T, StorageError> {
        match self.tree(keyspace).get(key.as_bytes())? {
            Some(value) => bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Err(StorageError::NotFound(format!(
                "{} not found in {}",
                key,
                keyspace.name()
            ))),
        }
    }

    /// Writes a value, overwriting any previous one
    pub fn put<T: Serialize>(&self, keyspace: Keyspace, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = bincode::serialize(value)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.tree(keyspace).insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Removes a key. Removing an absent key is not an error.
    pub fn delete(&self, keyspace: Keyspace, key: &str) -> Result<(), StorageError> {
        self.tree(keyspace).remove(key.as_bytes())?;
        Ok(())
    }

    /// Gets every entry of a keyspace
    ///
    /// Entries that fail to deserialize are skipped with a warning, unless
    /// none of them could be read.
    pub fn entries<T: DeserializeOwned>(&self, keyspace: Keyspace) -> Result<Vec<(String, T)>, StorageError> {
        let mut entries = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in self.tree(keyspace).iter() {
            let (key, value) = result?;
            let key_str = String::from_utf8_lossy(key.as_ref()).to_string();
            match bincode::deserialize::<T>(&value) {
                Ok(item) => entries.push((key_str, item)),
                Err(e) => {
                    deserialization_errors.push(format!("{}: {}", key_str, e));
                }
            }
        }

        if !deserialization_errors.is_empty() {
            if entries.is_empty() {
                return Err(StorageError::DeserializationError(format!(
                    "Failed to deserialize any entry of {}: {}",
                    keyspace.name(),
                    deserialization_errors.join(", ")
                )));
            }
            warn!(
                "Some entries of {} could not be deserialized: {}",
                keyspace.name(),
                deserialization_errors.join(", ")
            );
        }

        Ok(entries)
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key_is_not_found() {
        let storage = Storage::temporary().unwrap();

        let result: Result<String, _> = storage.get(Keyspace::Accounts, "missing");
        assert!(matches!(result, Err(StorageError::NotFound(_))));

        let optional: Option<String> = storage.get(Keyspace::Accounts, "missing").optional().unwrap();
        assert!(optional.is_none());
    }

    #[test]
    fn test_put_get_delete() {
        let storage = Storage::temporary().unwrap();

        storage.put(Keyspace::Metadata, "counter", &1001u32).unwrap();
        let value: u32 = storage.get(Keyspace::Metadata, "counter").unwrap();
        assert_eq!(value, 1001);

        storage.delete(Keyspace::Metadata, "counter").unwrap();
        let gone: Option<u32> = storage.get(Keyspace::Metadata, "counter").optional().unwrap();
        assert!(gone.is_none());

        // Deleting again is a no-op
        storage.delete(Keyspace::Metadata, "counter").unwrap();
    }

    #[test]
    fn test_keyspaces_are_independent() {
        let storage = Storage::temporary().unwrap();

        storage.put(Keyspace::Usernames, "key", &"a".to_string()).unwrap();
        storage.put(Keyspace::PendingTxs, "key", &"b".to_string()).unwrap();

        let a: String = storage.get(Keyspace::Usernames, "key").unwrap();
        let b: String = storage.get(Keyspace::PendingTxs, "key").unwrap();
        assert_eq!(a, "a");
        assert_eq!(b, "b");

        let entries: Vec<(String, String)> = storage.entries(Keyspace::Usernames).unwrap();
        assert_eq!(entries, vec![("key".to_string(), "a".to_string())]);
    }
}
