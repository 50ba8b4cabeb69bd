use std::sync::Arc;

use super::storage::{Keyspace, OptionalExt, Storage, StorageError};

/// Bidirectional username <-> user id map, so tips can address users by handle
#[derive(Debug, Clone)]
pub struct UsernameMap {
    storage: Arc<Storage>,
}

impl UsernameMap {
    pub fn new(storage: Arc<Storage>) -> Self {
        UsernameMap { storage }
    }

    /// Records that `username` belongs to `user_id`, dropping stale entries for both
    pub fn put(&self, username: &str, user_id: &str) -> Result<(), StorageError> {
        let username = username.to_lowercase();

        if let Some(previous_id) = self.get_id(&username)? {
            self.storage.delete(Keyspace::Usernames, &format!("id-{}", previous_id))?;
        }
        if let Some(previous_name) = self.get_username(user_id)? {
            self.storage.delete(Keyspace::Usernames, &format!("user-{}", previous_name))?;
        }

        self.storage.put(Keyspace::Usernames, &format!("user-{}", username), &user_id.to_string())?;
        self.storage.put(Keyspace::Usernames, &format!("id-{}", user_id), &username)
    }

    pub fn get_id(&self, username: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get(Keyspace::Usernames, &format!("user-{}", username.to_lowercase()))
            .optional()
    }

    pub fn get_username(&self, user_id: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get(Keyspace::Usernames, &format!("id-{}", user_id))
            .optional()
    }
}
