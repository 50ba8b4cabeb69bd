use chrono::{DateTime, Duration, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use std::sync::Arc;

use super::amount::Raw;
use super::storage::{Keyspace, OptionalExt, Storage, StorageError};

/// The kind of transfer a pending entry tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingAction {
    Tip,
    Withdraw,
}

/// A submitted transfer whose "sending…" message still needs finishing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTx {
    /// Hash of the send block
    pub id: String,

    pub action: PendingAction,

    pub sending_user_id: String,

    pub receiving_user_id: Option<String>,

    pub amount: Raw,

    pub chat_id: String,

    pub message_id: i64,

    /// Text to replay once confirmed
    pub text: String,

    /// JSON-encoded formatting parameters for `text`
    pub text_params: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// The chat message to finish once a transfer is received
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReply {
    pub chat_id: String,
    pub message_id: i64,
    pub text: String,

    /// JSON-encoded formatting parameters for `text`
    pub text_params: Option<String>,
}

impl PendingTx {
    /// A fresh entry for the send block `id`
    pub fn new(
        id: &str,
        action: PendingAction,
        sending_user_id: &str,
        receiving_user_id: Option<&str>,
        amount: &Raw,
        reply: &PendingReply,
    ) -> Self {
        PendingTx {
            id: id.to_string(),
            action,
            sending_user_id: sending_user_id.to_string(),
            receiving_user_id: receiving_user_id.map(str::to_string),
            amount: amount.clone(),
            chat_id: reply.chat_id.clone(),
            message_id: reply.message_id,
            text: reply.text.clone(),
            text_params: reply.text_params.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Persistent log of transfers awaiting confirmation, keyed by send block hash
#[derive(Debug, Clone)]
pub struct PendingTxLog {
    storage: Arc<Storage>,
}

impl PendingTxLog {
    pub fn new(storage: Arc<Storage>) -> Self {
        PendingTxLog { storage }
    }

    pub fn put(&self, tx: &PendingTx) -> Result<(), StorageError> {
        self.storage.put(Keyspace::PendingTxs, &tx.id, tx)
    }

    pub fn get(&self, id: &str) -> Result<Option<PendingTx>, StorageError> {
        self.storage.get(Keyspace::PendingTxs, id).optional()
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.storage.delete(Keyspace::PendingTxs, id)
    }

    /// Deletes entries older than `ttl`, whose block was never confirmed
    ///
    /// # Returns
    ///
    /// The number of entries removed
    pub fn sweep_expired(&self, ttl: Duration) -> Result<usize, StorageError> {
        self.sweep_expired_at(Utc::now(), ttl)
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> Result<usize, StorageError> {
        let cutoff = now - ttl;
        let mut removed = 0;

        for (id, tx) in self.storage.entries::<PendingTx>(Keyspace::PendingTxs)? {
            if tx.created_at < cutoff {
                info!("Expiring unconfirmed {:?} {} created at {}", tx.action, id, tx.created_at);
                self.storage.delete(Keyspace::PendingTxs, &id)?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}
