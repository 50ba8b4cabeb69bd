use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use std::sync::Arc;

use super::crypto::{Address, KeyPair, Seed};
use super::storage::{Keyspace, OptionalExt, Storage, StorageError};

/// Seed index handed to the first account ever created
pub const FIRST_SEED_INDEX: u32 = 1001;

const LAST_SEED_INDEX_KEY: &str = "last-seed-index";

/// Errors that can occur during account operations
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Seed index space exhausted")]
    SeedIndexExhausted,
}

/// A custodial account, one per chat user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Account {
    /// The chat platform user id
    pub user_id: String,

    /// Derivation index under the master seed
    pub seed_index: u32,

    /// The account's address, derived from `seed_index`
    pub address: Address,

    /// Reserved, never populated
    pub withdrawal_address: Option<Address>,
}

fn user_key(user_id: &str) -> String {
    format!("tg-{}", user_id)
}

fn address_key(address: &Address) -> String {
    format!("address-{}", address)
}

/// Maps chat users to derived accounts and hands out seed indices
pub struct AccountRegistry {
    storage: Arc<Storage>,
    seed: Seed,

    /// Serializes every account creation and seed index increment
    creation_lock: Mutex<()>,
}

impl std::fmt::Debug for AccountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRegistry").finish()
    }
}

impl AccountRegistry {
    pub fn new(storage: Arc<Storage>, seed: Seed) -> Self {
        AccountRegistry {
            storage,
            seed,
            creation_lock: Mutex::new(()),
        }
    }

    /// Gets the account of a user, creating it on first use
    ///
    /// # Arguments
    ///
    /// * `user_id` - The chat platform user id
    ///
    /// # Returns
    ///
    /// The existing or newly created account
    pub async fn get_or_create_account(&self, user_id: &str) -> Result<Account, AccountError> {
        if let Some(account) = self.get_account_by_user_id(user_id)? {
            return Ok(account);
        }

        let _guard = self.creation_lock.lock().await;

        // Another task may have created it while we waited
        if let Some(account) = self.get_account_by_user_id(user_id)? {
            return Ok(account);
        }

        let seed_index = self.increment_seed_index()?;
        let keys = KeyPair::from_seed(&self.seed, seed_index);
        let account = Account {
            user_id: user_id.to_string(),
            seed_index,
            address: keys.address().clone(),
            withdrawal_address: None,
        };
        self.save_account(&account)?;

        info!("Created account {} for user {} at seed index {}", account.address, user_id, seed_index);
        Ok(account)
    }

    /// Gets an account by its user id
    pub fn get_account_by_user_id(&self, user_id: &str) -> Result<Option<Account>, AccountError> {
        Ok(self.storage.get(Keyspace::Accounts, &user_key(user_id)).optional()?)
    }

    /// Gets an account by its address, for attributing ledger events
    pub fn get_account_by_address(&self, address: &Address) -> Result<Option<Account>, AccountError> {
        Ok(self.storage.get(Keyspace::Accounts, &address_key(address)).optional()?)
    }

    /// Returns the next unused seed index and advances the counter
    pub async fn get_and_increment_last_seed_index(&self) -> Result<u32, AccountError> {
        let _guard = self.creation_lock.lock().await;
        self.increment_seed_index()
    }

    /// Must be called with `creation_lock` held
    fn increment_seed_index(&self) -> Result<u32, AccountError> {
        let index: u32 = self
            .storage
            .get(Keyspace::Metadata, LAST_SEED_INDEX_KEY)
            .optional()?
            .unwrap_or(FIRST_SEED_INDEX);
        let next = index.checked_add(1).ok_or(AccountError::SeedIndexExhausted)?;

        self.storage.put(Keyspace::Metadata, LAST_SEED_INDEX_KEY, &next)?;
        Ok(index)
    }

    /// Saves an account under both its user id and its address
    ///
    /// If the second write fails, the first is rolled back.
    pub fn save_account(&self, account: &Account) -> Result<(), AccountError> {
        let by_user = user_key(&account.user_id);
        let by_address = address_key(&account.address);

        let result = self
            .storage
            .put(Keyspace::Accounts, &by_user, account)
            .and_then(|_| self.storage.put(Keyspace::Accounts, &by_address, account));

        if let Err(err) = result {
            for key in [&by_user, &by_address] {
                if let Err(cleanup_err) = self.storage.delete(Keyspace::Accounts, key) {
                    warn!("Failed to roll back {}: {}", key, cleanup_err);
                }
            }
            return Err(err.into());
        }

        Ok(())
    }

    /// Re-derives the keys of an account. The result must not outlive its use.
    pub fn key_pair(&self, account: &Account) -> KeyPair {
        KeyPair::from_seed(&self.seed, account.seed_index)
    }
}
