use async_trait::async_trait;
use dashmap::DashMap;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use std::sync::Arc;

use super::amount::Raw;
use super::block::{Block, BlockError, BlockSubtype};
use super::crypto::{Address, CryptoError, KeyPair};
use super::rpc::{AccountBalance, NodeRpc, RpcError};
use super::work::{WorkError, WorkService, RECEIVE_DIFFICULTY};

/// Receivable blocks handled per `process_pending_blocks` call
pub const PENDING_BATCH: usize = 10;

/// Errors that can occur while talking to the ledger
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("RPC error: {0}")]
    RpcError(#[from] RpcError),

    #[error("Work error: {0}")]
    WorkError(#[from] WorkError),

    #[error("Block error: {0}")]
    BlockError(#[from] BlockError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Account {0} has no frontier and cannot send")]
    AccountNotOpened(Address),

    #[error("Ledger balance {available} of {address} cannot cover {required}")]
    BalanceUnderflow {
        address: Address,
        required: Raw,
        available: Raw,
    },

    #[error("No online representatives found")]
    NoOnlineRepresentatives,

    #[error("Invalid block hash: {0}")]
    InvalidHash(String),
}

/// A block accepted by the node
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedBlock {
    /// The block hash, which doubles as the transaction id
    pub hash: String,
    pub block: Block,
}

/// The ledger operations the settlement engine relies on
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get_balance(&self, address: &Address) -> Result<AccountBalance, LedgerError>;

    /// Signs and publishes a send of `amount` from `keys` to `to`
    async fn send(&self, keys: &KeyPair, to: &Address, amount: &Raw) -> Result<SubmittedBlock, LedgerError>;

    /// Receives up to `PENDING_BATCH` incoming blocks, one after another
    async fn process_pending_blocks(&self, keys: &KeyPair) -> Result<Vec<SubmittedBlock>, LedgerError>;

    /// The account that owns a block
    async fn block_account(&self, hash: &str) -> Result<Address, LedgerError>;
}

/// Builds, signs, and publishes blocks for custodial accounts
pub struct LedgerClient {
    rpc: Arc<dyn NodeRpc>,
    work: Arc<WorkService>,

    /// Held while a block is built on an account's frontier and published
    chain_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LedgerClient {
    pub fn new(rpc: Arc<dyn NodeRpc>, work: Arc<WorkService>) -> Self {
        LedgerClient {
            rpc,
            work,
            chain_locks: DashMap::new(),
        }
    }

    fn chain_lock(&self, address: &Address) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(address.0.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn online_representative(&self) -> Result<Address, LedgerError> {
        self.rpc
            .representatives_online()
            .await?
            .into_iter()
            .next()
            .ok_or(LedgerError::NoOnlineRepresentatives)
    }

    /// Work for the block after `hash` is computed in the background
    fn precompute_next_work(&self, hash: &str) {
        let work = self.work.clone();
        let hash = hash.to_string();
        tokio::spawn(async move {
            work.generate_and_cache_work(&hash).await;
        });
    }

    async fn publish(&self, mut block: Block, hash: String, subtype: BlockSubtype, work: String) -> Result<SubmittedBlock, LedgerError> {
        block.work = Some(work);
        let processed = self.rpc.process(&block, subtype).await?;
        if !processed.eq_ignore_ascii_case(&hash) {
            warn!("Node reported hash {} for {} block {}", processed, subtype.as_str(), hash);
        }

        self.precompute_next_work(&hash);
        Ok(SubmittedBlock { hash, block })
    }

    /// Credits `amount` from the send block `from_block_hash`
    ///
    /// Opens the account when it has no frontier yet; the representative is
    /// then taken from the online voters.
    pub async fn receive(&self, keys: &KeyPair, from_block_hash: &str, amount: &Raw) -> Result<SubmittedBlock, LedgerError> {
        let lock = self.chain_lock(keys.address());
        let _guard = lock.lock().await;
        self.receive_on_frontier(keys, from_block_hash, amount).await
    }

    // Callers hold the account's chain lock
    async fn receive_on_frontier(&self, keys: &KeyPair, from_block_hash: &str, amount: &Raw) -> Result<SubmittedBlock, LedgerError> {
        let info = self.rpc.account_info(keys.address()).await?;

        let representative = match info.as_ref().and_then(|i| i.representative.clone()) {
            Some(representative) => representative,
            None => self.online_representative().await?,
        };
        let balance = match &info {
            Some(info) => &info.balance + amount,
            None => amount.clone(),
        };
        let previous = info.as_ref().map(|i| i.frontier.as_str());
        let link: [u8; 32] = hex::decode(from_block_hash)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| LedgerError::InvalidHash(from_block_hash.to_string()))?;

        let (hash, block) = Block::new_signed(keys, previous, representative, balance, link)?;

        let root = previous
            .map(str::to_string)
            .unwrap_or_else(|| keys.public_key().to_hex());
        let work = self.work.generate_work(&root, Some(RECEIVE_DIFFICULTY)).await?;

        let subtype = if previous.is_some() {
            BlockSubtype::Receive
        } else {
            BlockSubtype::Open
        };
        self.publish(block, hash, subtype, work.work).await
    }
}

#[async_trait]
impl Ledger for LedgerClient {
    async fn get_balance(&self, address: &Address) -> Result<AccountBalance, LedgerError> {
        Ok(self.rpc.account_balance(address).await?)
    }

    async fn send(&self, keys: &KeyPair, to: &Address, amount: &Raw) -> Result<SubmittedBlock, LedgerError> {
        let lock = self.chain_lock(keys.address());
        let _guard = lock.lock().await;

        let info = self
            .rpc
            .account_info(keys.address())
            .await?
            .ok_or_else(|| LedgerError::AccountNotOpened(keys.address().clone()))?;

        let balance = info
            .balance
            .checked_sub(amount)
            .ok_or_else(|| LedgerError::BalanceUnderflow {
                address: keys.address().clone(),
                required: amount.clone(),
                available: info.balance.clone(),
            })?;
        let representative = match info.representative.clone() {
            Some(representative) => representative,
            None => self.online_representative().await?,
        };
        let link = to.to_public_key()?.0;

        let (hash, block) = Block::new_signed(keys, Some(&info.frontier), representative, balance, link)?;
        let work = self.work.generate_work(&info.frontier, None).await?;

        info!("Sending {} raw from {} to {} in {}", amount, keys.address(), to, hash);
        self.publish(block, hash, BlockSubtype::Send, work.work).await
    }

    async fn process_pending_blocks(&self, keys: &KeyPair) -> Result<Vec<SubmittedBlock>, LedgerError> {
        let address = keys.address();
        let lock = self.chain_lock(address);
        let _guard = lock.lock().await;

        let pending = self.rpc.accounts_pending(address, PENDING_BATCH).await?;
        let mut received = Vec::with_capacity(pending.len());
        for incoming in pending {
            info!("Creating receive block for {} on {}", incoming.hash, address);
            let block = self.receive_on_frontier(keys, &incoming.hash, &incoming.amount).await?;
            info!("Created receive block {} for {} on {}", block.hash, incoming.hash, address);
            received.push(block);
        }

        Ok(received)
    }

    async fn block_account(&self, hash: &str) -> Result<Address, LedgerError> {
        Ok(self.rpc.block_account(hash).await?)
    }
}
