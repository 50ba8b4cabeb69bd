// Settlement module
//
// Custodial accounts derived from one master seed, the ledger node
// boundary, and the engine that moves funds and classifies confirmations.

pub mod account;
pub mod amount;
pub mod block;
pub mod classifier;
pub mod crypto;
pub mod engine;
pub mod ledger;
pub mod pending;
pub mod rpc;
pub mod storage;
pub mod stream;
pub mod username;
pub mod work;

pub use account::{Account, AccountError, AccountRegistry};
pub use amount::Raw;
pub use classifier::{TransactionEvent, TxAction, TxStatus};
pub use crypto::{Address, KeyPair, Seed};
pub use engine::{BusinessError, ConfirmationHandler, Links, SettlementEngine, SettlementError};
pub use ledger::{Ledger, LedgerClient, SubmittedBlock};
pub use pending::{PendingAction, PendingReply, PendingTx, PendingTxLog};
pub use storage::{Storage, StorageError};
pub use username::UsernameMap;

use log::info;

use std::sync::Arc;

use crate::config::Config;
use rpc::{HttpNodeRpc, NodeRpc, RpcError};
use work::{CpuWorkGenerator, RemoteWorkGenerator, WorkCache, WorkGenerator, WorkService};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("RPC error: {0}")]
    RpcError(#[from] RpcError),
}

/// Everything the service shares, built once at startup
pub struct Settlement {
    pub storage: Arc<Storage>,
    pub engine: Arc<SettlementEngine>,
    pub pending: PendingTxLog,
    pub usernames: UsernameMap,
}

impl Settlement {
    pub fn from_config(config: &Config) -> Result<Self, ContextError> {
        let storage = Arc::new(Storage::new(&config.db_file)?);
        info!("Opened database at {}", config.db_file.display());

        let node: Arc<dyn NodeRpc> = Arc::new(HttpNodeRpc::new(
            config.node_url.clone(),
            config.node_api_key.as_deref(),
            config.rpc_timeout,
        )?);

        let mut remotes: Vec<Arc<dyn WorkGenerator>> = Vec::with_capacity(config.work_peers.len());
        for peer in &config.work_peers {
            let rpc = HttpNodeRpc::new(peer.url.clone(), peer.api_key.as_deref(), config.rpc_timeout)?;
            remotes.push(Arc::new(RemoteWorkGenerator::new(Arc::new(rpc))));
        }
        info!("Using {} remote work generators", remotes.len());

        let work = Arc::new(WorkService::new(
            WorkCache::new(storage.clone()),
            remotes,
            Arc::new(CpuWorkGenerator::default()),
        ));
        let ledger: Arc<dyn Ledger> = Arc::new(LedgerClient::new(node, work));

        Ok(Self::new(storage, config.seed.clone(), ledger, Links::new(config.explorer_url.clone())))
    }

    /// Wires the engine over an already opened store and ledger
    pub fn new(storage: Arc<Storage>, seed: Seed, ledger: Arc<dyn Ledger>, links: Links) -> Self {
        let registry = Arc::new(AccountRegistry::new(storage.clone(), seed));
        let pending = PendingTxLog::new(storage.clone());
        let engine = Arc::new(SettlementEngine::new(registry, ledger, pending.clone(), links));

        Settlement {
            usernames: UsernameMap::new(storage.clone()),
            storage,
            engine,
            pending,
        }
    }
}
