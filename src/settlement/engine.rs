use async_trait::async_trait;
use dashmap::DashMap;
use log::{error, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use std::sync::Arc;

use super::account::{Account, AccountError, AccountRegistry};
use super::amount::Raw;
use super::classifier::{Classifier, ClassifyError, TransactionEvent, TxAction, TxStatus};
use super::crypto::Address;
use super::ledger::{Ledger, LedgerError, SubmittedBlock};
use super::pending::{PendingAction, PendingReply, PendingTx, PendingTxLog};
use super::rpc::AccountBalance;
use super::storage::StorageError;
use super::stream::Confirmation;

/// 0.01 Nano, suggested in top-up links
pub const TOP_UP_AMOUNT_RAW: &str = "10000000000000000000000000000";

/// Failures caused by the request rather than by the system
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusinessError {
    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { required: Raw, available: Raw },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl BusinessError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BusinessError::InsufficientBalance { .. } => "insufficient_balance",
            BusinessError::InvalidAmount(_) => "invalid_amount",
            BusinessError::InvalidAddress(_) => "invalid_address",
        }
    }
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Business(#[from] BusinessError),

    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Classification error: {0}")]
    ClassifyError(#[from] ClassifyError),

    #[error("Confirmation handler failed: {0}")]
    HandlerError(String),
}

impl SettlementError {
    pub fn is_business(&self) -> bool {
        matches!(self, SettlementError::Business(_))
    }
}

/// Receives classified confirmations
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn on_tip(&self, event: &TransactionEvent) -> anyhow::Result<()>;

    async fn on_withdraw(&self, event: &TransactionEvent) -> anyhow::Result<()>;

    async fn on_top_up(&self, event: &TransactionEvent) -> anyhow::Result<()>;
}

/// Builds payment and block explorer links
#[derive(Debug, Clone)]
pub struct Links {
    explorer_url: String,
}

impl Links {
    pub fn new(explorer_url: impl Into<String>) -> Self {
        let explorer_url: String = explorer_url.into();
        Links {
            explorer_url: explorer_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn top_up(&self, address: &Address) -> String {
        format!("nano:{}?amount={}", address, TOP_UP_AMOUNT_RAW)
    }

    pub fn account(&self, address: &Address) -> String {
        format!("{}/account/{}", self.explorer_url, address)
    }

    pub fn block(&self, hash: &str) -> String {
        format!("{}/block/{}", self.explorer_url, hash)
    }
}

/// Moves funds between custodial accounts and the outside world
pub struct SettlementEngine {
    registry: Arc<AccountRegistry>,
    ledger: Arc<dyn Ledger>,
    pending: PendingTxLog,
    classifier: Classifier,
    links: Links,

    /// Held from the balance check until the send is published
    send_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SettlementEngine {
    pub fn new(registry: Arc<AccountRegistry>, ledger: Arc<dyn Ledger>, pending: PendingTxLog, links: Links) -> Self {
        SettlementEngine {
            classifier: Classifier::new(registry.clone(), ledger.clone()),
            registry,
            ledger,
            pending,
            links,
            send_locks: DashMap::new(),
        }
    }

    fn send_lock(&self, address: &Address) -> Arc<Mutex<()>> {
        self.send_locks
            .entry(address.0.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Checks the balance and sends, without letting another send from the
    /// same account interleave
    async fn send_from(&self, from: &Account, to: &Address, amount: &Raw) -> Result<SubmittedBlock, SettlementError> {
        if amount.is_zero() {
            return Err(BusinessError::InvalidAmount("amount must be greater than zero".to_string()).into());
        }

        let lock = self.send_lock(&from.address);
        let _guard = lock.lock().await;

        let available = self.ledger.get_balance(&from.address).await?.balance;
        if available < *amount {
            return Err(BusinessError::InsufficientBalance {
                required: amount.clone(),
                available,
            }
            .into());
        }

        let keys = self.registry.key_pair(from);
        Ok(self.ledger.send(&keys, to, amount).await?)
    }

    /// Receives in the background; failures are only logged
    fn spawn_receive(&self, account: &Account) {
        let ledger = self.ledger.clone();
        let keys = self.registry.key_pair(account);
        tokio::spawn(async move {
            if let Err(err) = ledger.process_pending_blocks(&keys).await {
                warn!("Failed to receive pending blocks for {}: {}", keys.address(), err);
            }
        });
    }

    /// Tips `amount` raw from one user to another
    ///
    /// Both accounts are created on first use. The recipient's receive runs
    /// in the background.
    ///
    /// # Returns
    ///
    /// The send block hash
    pub async fn tip_user(&self, from_user_id: &str, to_user_id: &str, amount: &Raw) -> Result<String, SettlementError> {
        self.tip_user_with_reply(from_user_id, to_user_id, amount, None).await
    }

    /// Like `tip_user`, remembering `reply` before the receive starts
    pub async fn tip_user_with_reply(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        amount: &Raw,
        reply: Option<&PendingReply>,
    ) -> Result<String, SettlementError> {
        let from = self.registry.get_or_create_account(from_user_id).await?;
        let to = self.registry.get_or_create_account(to_user_id).await?;

        let block = self.send_from(&from, &to.address, amount).await?;
        info!("Tip {} from {} to {}: {} raw", block.hash, from_user_id, to_user_id, amount);

        if let Some(reply) = reply {
            let tx = PendingTx::new(&block.hash, PendingAction::Tip, from_user_id, Some(to_user_id), amount, reply);
            self.remember_reply(&tx);
        }

        self.spawn_receive(&to);
        Ok(block.hash)
    }

    /// The transfer already went out, so a failure here is only logged
    fn remember_reply(&self, tx: &PendingTx) {
        if let Err(err) = self.pending.put(tx) {
            warn!("Failed to record pending {:?} {}: {}", tx.action, tx.id, err);
        }
    }

    /// Withdraws `amount` raw from a user to an external address
    pub async fn withdraw_to_address(&self, from_user_id: &str, to_address: &str, amount: &Raw) -> Result<String, SettlementError> {
        self.withdraw_to_address_with_reply(from_user_id, to_address, amount, None).await
    }

    pub async fn withdraw_to_address_with_reply(
        &self,
        from_user_id: &str,
        to_address: &str,
        amount: &Raw,
        reply: Option<&PendingReply>,
    ) -> Result<String, SettlementError> {
        let destination = to_address
            .parse::<Address>()
            .and_then(|address| address.to_public_key())
            .map(|key| Address::from_public_key(&key))
            .map_err(|e| BusinessError::InvalidAddress(e.to_string()))?;

        let from = self.registry.get_or_create_account(from_user_id).await?;
        let block = self.send_from(&from, &destination, amount).await?;
        info!("Withdrawal {} from {} to {}: {} raw", block.hash, from_user_id, destination, amount);

        if let Some(reply) = reply {
            let tx = PendingTx::new(&block.hash, PendingAction::Withdraw, from_user_id, None, amount, reply);
            self.remember_reply(&tx);
        }

        Ok(block.hash)
    }

    pub async fn get_account(&self, user_id: &str) -> Result<Account, SettlementError> {
        Ok(self.registry.get_or_create_account(user_id).await?)
    }

    pub async fn get_balance(&self, user_id: &str) -> Result<AccountBalance, SettlementError> {
        let account = self.get_account(user_id).await?;
        Ok(self.ledger.get_balance(&account.address).await?)
    }

    pub async fn get_link_for_top_up(&self, user_id: &str) -> Result<String, SettlementError> {
        let account = self.get_account(user_id).await?;
        Ok(self.links.top_up(&account.address))
    }

    pub fn get_link_for_account(&self, address: &Address) -> String {
        self.links.account(address)
    }

    pub fn get_link_for_block(&self, hash: &str) -> String {
        self.links.block(hash)
    }

    /// Receives everything pending for a user right away
    pub async fn receive_pending_for_user(&self, user_id: &str) -> Result<Vec<SubmittedBlock>, SettlementError> {
        let account = self.get_account(user_id).await?;
        let keys = self.registry.key_pair(&account);
        Ok(self.ledger.process_pending_blocks(&keys).await?)
    }

    /// Remembers a submitted transfer until its receive is confirmed
    pub fn record_pending_tx(&self, tx: &PendingTx) -> Result<(), SettlementError> {
        Ok(self.pending.put(tx)?)
    }

    async fn dispatch(&self, handler: &dyn ConfirmationHandler, event: &TransactionEvent) -> Result<(), SettlementError> {
        let result = match event.action {
            TxAction::Tip => handler.on_tip(event).await,
            TxAction::Withdraw => handler.on_withdraw(event).await,
            TxAction::TopUp => handler.on_top_up(event).await,
        };
        result.map_err(|e| SettlementError::HandlerError(e.to_string()))
    }

    /// Classifies one confirmation and notifies `handler`
    pub async fn handle_confirmation(&self, confirmation: &Confirmation, handler: &dyn ConfirmationHandler) -> Result<(), SettlementError> {
        let Some(mut event) = self.classifier.classify(confirmation).await? else {
            return Ok(());
        };

        match (event.status, event.action) {
            (TxStatus::Pending, TxAction::Tip | TxAction::TopUp) => {
                if let Some(receiving) = &event.receiving {
                    let keys = self.registry.key_pair(receiving);
                    if let Err(err) = self.ledger.process_pending_blocks(&keys).await {
                        warn!("Failed to receive {} for {}: {}", event.id, receiving.address, err);
                    }
                }
                self.dispatch(handler, &event).await
            }
            (TxStatus::Pending, TxAction::Withdraw) => self.dispatch(handler, &event).await,
            (TxStatus::Confirmed, _) => {
                event.pending_tx = self.pending.get(&event.source_hash)?;
                self.dispatch(handler, &event).await?;
                if event.pending_tx.is_some() {
                    self.pending.delete(&event.source_hash)?;
                }
                Ok(())
            }
        }
    }

    /// Processes every confirmation from `confirmations` in its own task
    ///
    /// The returned task ends when the stream does.
    pub fn subscribe_to_confirmed_tx(
        self: &Arc<Self>,
        mut confirmations: mpsc::Receiver<Confirmation>,
        handler: Arc<dyn ConfirmationHandler>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(confirmation) = confirmations.recv().await {
                let engine = engine.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(err) = engine.handle_confirmation(&confirmation, handler.as_ref()).await {
                        error!("Failed to handle confirmation {}: {}", confirmation.hash, err);
                    }
                });
            }
            info!("Confirmation stream ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::block::{Block, BlockSubtype};
    use crate::settlement::crypto::{KeyPair, Seed};
    use crate::settlement::pending::PendingAction;
    use crate::settlement::storage::Storage;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const FRONTIER: &str = "991CF190094C00F0B68E2E5F75F6BEE95A2E0BD93CEAA4A6734DB9F19B728948";

    /// Ledger with in-memory balances that records what it was asked to do
    #[derive(Default)]
    struct MockLedger {
        balances: StdMutex<HashMap<Address, Raw>>,
        block_accounts: StdMutex<HashMap<String, Address>>,
        sends: StdMutex<Vec<(Address, Address, Raw)>>,
        receives: StdMutex<Vec<Address>>,

        /// When set, each receive notes whether the last send has a pending entry
        pending_log: StdMutex<Option<PendingTxLog>>,
        sent_hashes: StdMutex<Vec<String>>,
        pending_at_receive: StdMutex<Vec<bool>>,
    }

    impl MockLedger {
        fn fund(&self, address: &Address, amount: u128) {
            self.balances.lock().unwrap().insert(address.clone(), Raw::from(amount));
        }

        fn sends(&self) -> usize {
            self.sends.lock().unwrap().len()
        }

        fn receives_of(&self, address: &Address) -> usize {
            self.receives.lock().unwrap().iter().filter(|a| *a == address).count()
        }
    }

    #[async_trait]
    impl Ledger for MockLedger {
        async fn get_balance(&self, address: &Address) -> Result<AccountBalance, LedgerError> {
            let balance = self.balances.lock().unwrap().get(address).cloned().unwrap_or_default();
            Ok(AccountBalance { balance, pending: Raw::zero() })
        }

        async fn send(&self, keys: &KeyPair, to: &Address, amount: &Raw) -> Result<SubmittedBlock, LedgerError> {
            // Leave room for a racing balance check
            tokio::time::sleep(Duration::from_millis(20)).await;

            let remaining = {
                let mut balances = self.balances.lock().unwrap();
                let balance = balances.entry(keys.address().clone()).or_default();
                let remaining = balance.checked_sub(amount).ok_or_else(|| LedgerError::BalanceUnderflow {
                    address: keys.address().clone(),
                    required: amount.clone(),
                    available: balance.clone(),
                })?;
                *balance = remaining.clone();
                remaining
            };
            self.sends.lock().unwrap().push((keys.address().clone(), to.clone(), amount.clone()));

            let (hash, block) = Block::new_signed(keys, Some(FRONTIER), keys.address().clone(), remaining, to.to_public_key()?.0)?;
            self.sent_hashes.lock().unwrap().push(hash.clone());
            Ok(SubmittedBlock { hash, block })
        }

        async fn process_pending_blocks(&self, keys: &KeyPair) -> Result<Vec<SubmittedBlock>, LedgerError> {
            let log = self.pending_log.lock().unwrap().clone();
            if let Some(log) = log {
                let last_send = self.sent_hashes.lock().unwrap().last().cloned();
                let recorded = match last_send {
                    Some(hash) => log.get(&hash).unwrap().is_some(),
                    None => false,
                };
                self.pending_at_receive.lock().unwrap().push(recorded);
            }
            self.receives.lock().unwrap().push(keys.address().clone());
            Ok(Vec::new())
        }

        async fn block_account(&self, hash: &str) -> Result<Address, LedgerError> {
            self.block_accounts
                .lock()
                .unwrap()
                .get(hash)
                .cloned()
                .ok_or_else(|| LedgerError::InvalidHash(hash.to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        events: StdMutex<Vec<(&'static str, TransactionEvent)>>,
    }

    impl RecordingHandler {
        fn events(&self) -> Vec<(&'static str, TransactionEvent)> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConfirmationHandler for RecordingHandler {
        async fn on_tip(&self, event: &TransactionEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(("tip", event.clone()));
            Ok(())
        }

        async fn on_withdraw(&self, event: &TransactionEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(("withdraw", event.clone()));
            Ok(())
        }

        async fn on_top_up(&self, event: &TransactionEvent) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(("topup", event.clone()));
            Ok(())
        }
    }

    struct Fixture {
        engine: Arc<SettlementEngine>,
        ledger: Arc<MockLedger>,
        pending: PendingTxLog,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(Storage::temporary().unwrap());
        let registry = Arc::new(AccountRegistry::new(storage.clone(), Seed::generate()));
        let ledger = Arc::new(MockLedger::default());
        let pending = PendingTxLog::new(storage);
        let engine = Arc::new(SettlementEngine::new(
            registry,
            ledger.clone(),
            pending.clone(),
            Links::new("https://nanolooker.com/"),
        ));
        Fixture { engine, ledger, pending }
    }

    fn outsider(index: u32) -> Address {
        KeyPair::from_seed(&Seed::generate(), index).address().clone()
    }

    fn confirmation(hash: &str, subtype: BlockSubtype, account: &Address, link: [u8; 32], amount: u128) -> Confirmation {
        let keys = KeyPair::from_seed(&Seed::generate(), 0);
        let (_, mut block) = Block::new_signed(&keys, Some(FRONTIER), account.clone(), Raw::zero(), link).unwrap();
        block.account = account.clone();
        block.subtype = Some(subtype);
        Confirmation {
            hash: hash.to_string(),
            amount: Some(Raw::from(amount)),
            block,
        }
    }

    fn send_to(hash: &str, from: &Address, to: &Address) -> Confirmation {
        confirmation(hash, BlockSubtype::Send, from, to.to_public_key().unwrap().0, 100)
    }

    fn receive_of(hash: &str, account: &Address, source_hash: &str) -> Confirmation {
        let mut link = [0u8; 32];
        link.copy_from_slice(&hex::decode(source_hash).unwrap());
        confirmation(hash, BlockSubtype::Receive, account, link, 100)
    }

    async fn wait_for_receives(ledger: &MockLedger, address: &Address) {
        for _ in 0..100 {
            if ledger.receives_of(address) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Let any duplicate receive surface
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_tip_with_insufficient_balance_never_sends() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        f.ledger.fund(&alice.address, 50);

        let err = f.engine.tip_user("alice", "bob", &Raw::from(100)).await.unwrap_err();

        assert!(err.is_business());
        assert!(matches!(
            err,
            SettlementError::Business(BusinessError::InsufficientBalance { ref required, ref available })
                if *required == Raw::from(100) && *available == Raw::from(50)
        ));
        assert_eq!(f.ledger.sends(), 0);
    }

    #[tokio::test]
    async fn test_tip_sends_and_receives_for_recipient_once() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        f.ledger.fund(&alice.address, 1_000);

        let hash = f.engine.tip_user("alice", "bob", &Raw::from(300)).await.unwrap();

        let bob = f.engine.get_account("bob").await.unwrap();
        assert_eq!(f.engine.get_link_for_block(&hash), format!("https://nanolooker.com/block/{}", hash));
        assert_eq!(f.ledger.sends.lock().unwrap()[0], (alice.address.clone(), bob.address.clone(), Raw::from(300)));

        wait_for_receives(&f.ledger, &bob.address).await;
        assert_eq!(f.ledger.receives_of(&bob.address), 1);
    }

    #[tokio::test]
    async fn test_zero_amount_is_rejected() {
        let f = fixture();

        let err = f.engine.tip_user("alice", "bob", &Raw::zero()).await.unwrap_err();

        assert!(matches!(err, SettlementError::Business(BusinessError::InvalidAmount(_))));
        assert_eq!(f.ledger.sends(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_tips_only_one_affordable() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        f.ledger.fund(&alice.address, 100);

        let amount = Raw::from(60);
        let (first, second) = tokio::join!(
            f.engine.tip_user("alice", "bob", &amount),
            f.engine.tip_user("alice", "carol", &amount),
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, SettlementError::Business(BusinessError::InsufficientBalance { .. }))));
        assert_eq!(f.ledger.sends(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_validates_address() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        f.ledger.fund(&alice.address, 100);

        let err = f
            .engine
            .withdraw_to_address("alice", "nano_not_an_address", &Raw::from(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Business(BusinessError::InvalidAddress(_))));

        let external = outsider(3);
        f.engine.withdraw_to_address("alice", &external.0, &Raw::from(40)).await.unwrap();
        assert_eq!(f.ledger.sends.lock().unwrap()[0].1, external);
        assert_eq!(f.ledger.receives.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_links() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();

        assert_eq!(
            f.engine.get_link_for_top_up("alice").await.unwrap(),
            format!("nano:{}?amount=10000000000000000000000000000", alice.address)
        );
        assert_eq!(
            f.engine.get_link_for_account(&alice.address),
            format!("https://nanolooker.com/account/{}", alice.address)
        );
    }

    #[tokio::test]
    async fn test_confirmed_send_between_users_is_pending_tip() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        let bob = f.engine.get_account("bob").await.unwrap();
        let handler = RecordingHandler::default();

        f.engine
            .handle_confirmation(&send_to("AA01", &alice.address, &bob.address), &handler)
            .await
            .unwrap();

        let events = handler.events();
        assert_eq!(events.len(), 1);
        let (kind, event) = &events[0];
        assert_eq!(*kind, "tip");
        assert_eq!(event.status, TxStatus::Pending);
        assert_eq!(event.sending.as_ref(), Some(&alice));
        assert_eq!(event.receiving.as_ref(), Some(&bob));
        assert_eq!(event.source_hash, "AA01");
        assert_eq!(f.ledger.receives_of(&bob.address), 1);
    }

    #[tokio::test]
    async fn test_paired_receive_is_confirmed_tip_and_clears_pending_tx() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        let bob = f.engine.get_account("bob").await.unwrap();
        let send_hash = "5D1AA8F9F7F9C1D1B1C6D1E4B08B3B5C4A6E7C0F1A2B3C4D5E6F708192A3B4C5";
        f.ledger.block_accounts.lock().unwrap().insert(send_hash.to_string(), alice.address.clone());

        let tx = PendingTx {
            id: send_hash.to_string(),
            action: PendingAction::Tip,
            sending_user_id: "alice".to_string(),
            receiving_user_id: Some("bob".to_string()),
            amount: Raw::from(100),
            chat_id: "-1".to_string(),
            message_id: 9,
            text: "Sent".to_string(),
            text_params: None,
            created_at: Utc::now(),
        };
        f.engine.record_pending_tx(&tx).unwrap();
        let handler = RecordingHandler::default();

        f.engine
            .handle_confirmation(&receive_of("BB02", &bob.address, send_hash), &handler)
            .await
            .unwrap();

        let events = handler.events();
        let (kind, event) = &events[0];
        assert_eq!(*kind, "tip");
        assert_eq!(event.status, TxStatus::Confirmed);
        assert_eq!(event.sending.as_ref(), Some(&alice));
        assert_eq!(event.receiving.as_ref(), Some(&bob));
        assert_eq!(event.pending_tx.as_ref(), Some(&tx));
        assert!(f.pending.get(send_hash).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_to_outsider_is_pending_withdraw() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        let handler = RecordingHandler::default();

        f.engine
            .handle_confirmation(&send_to("CC03", &alice.address, &outsider(1)), &handler)
            .await
            .unwrap();

        let events = handler.events();
        assert_eq!(events[0].0, "withdraw");
        assert_eq!(events[0].1.status, TxStatus::Pending);
        assert_eq!(events[0].1.receiving, None);
        assert!(f.ledger.receives.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_receive_from_outsider_is_confirmed_top_up() {
        let f = fixture();
        let bob = f.engine.get_account("bob").await.unwrap();
        let send_hash = "991CF190094C00F0B68E2E5F75F6BEE95A2E0BD93CEAA4A6734DB9F19B728948";
        f.ledger.block_accounts.lock().unwrap().insert(send_hash.to_string(), outsider(2));
        let handler = RecordingHandler::default();

        f.engine
            .handle_confirmation(&receive_of("DD04", &bob.address, send_hash), &handler)
            .await
            .unwrap();

        let events = handler.events();
        assert_eq!(events[0].0, "topup");
        assert_eq!(events[0].1.status, TxStatus::Confirmed);
        assert_eq!(events[0].1.receiving.as_ref(), Some(&bob));
        assert_eq!(events[0].1.pending_tx, None);
    }

    #[tokio::test]
    async fn test_unrelated_confirmation_has_no_callback() {
        let f = fixture();
        let handler = RecordingHandler::default();

        f.engine
            .handle_confirmation(&send_to("EE05", &outsider(1), &outsider(2)), &handler)
            .await
            .unwrap();
        let mut change = send_to("EE06", &outsider(1), &outsider(2));
        change.block.subtype = Some(BlockSubtype::Change);
        f.engine.handle_confirmation(&change, &handler).await.unwrap();

        assert!(handler.events().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_dispatches_each_confirmation() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        let bob = f.engine.get_account("bob").await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (sender, receiver) = mpsc::channel(8);

        let task = f.engine.subscribe_to_confirmed_tx(receiver, handler.clone());
        sender.send(send_to("FF07", &alice.address, &bob.address)).await.unwrap();
        sender.send(send_to("FF08", &bob.address, &outsider(4))).await.unwrap();
        drop(sender);
        task.await.unwrap();

        for _ in 0..100 {
            if handler.events().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut kinds: Vec<_> = handler.events().into_iter().map(|(kind, _)| kind).collect();
        kinds.sort();
        assert_eq!(kinds, vec!["tip", "withdraw"]);
    }

    #[tokio::test]
    async fn test_subscription_survives_failing_confirmation() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        let bob = f.engine.get_account("bob").await.unwrap();
        let handler = Arc::new(RecordingHandler::default());
        let (sender, receiver) = mpsc::channel(8);

        let task = f.engine.subscribe_to_confirmed_tx(receiver, handler.clone());
        // The source block is unknown to the ledger, so classification fails
        let unknown_source = "0000000000000000000000000000000000000000000000000000000000000001";
        sender.send(receive_of("AB09", &bob.address, unknown_source)).await.unwrap();
        sender.send(send_to("AB10", &alice.address, &bob.address)).await.unwrap();
        sender.send(send_to("AB11", &bob.address, &outsider(5))).await.unwrap();
        drop(sender);
        task.await.unwrap();

        for _ in 0..100 {
            if handler.events().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut ids: Vec<_> = handler.events().into_iter().map(|(kind, event)| (kind, event.id)).collect();
        ids.sort();
        assert_eq!(ids, vec![("tip", "AB10".to_string()), ("withdraw", "AB11".to_string())]);
    }

    #[tokio::test]
    async fn test_tip_reply_is_recorded_before_receive() {
        let f = fixture();
        *f.ledger.pending_log.lock().unwrap() = Some(f.pending.clone());
        let alice = f.engine.get_account("alice").await.unwrap();
        f.ledger.fund(&alice.address, 500);
        let reply = PendingReply {
            chat_id: "-100".to_string(),
            message_id: 42,
            text: "Sending...".to_string(),
            text_params: Some(r#"{"amount":"5"}"#.to_string()),
        };

        let hash = f
            .engine
            .tip_user_with_reply("alice", "bob", &Raw::from(5), Some(&reply))
            .await
            .unwrap();

        let tx = f.pending.get(&hash).unwrap().unwrap();
        assert_eq!(tx.action, PendingAction::Tip);
        assert_eq!(tx.sending_user_id, "alice");
        assert_eq!(tx.receiving_user_id.as_deref(), Some("bob"));
        assert_eq!(tx.amount, Raw::from(5));
        assert_eq!(tx.message_id, 42);
        assert_eq!(tx.text_params, reply.text_params);

        let bob = f.engine.get_account("bob").await.unwrap();
        wait_for_receives(&f.ledger, &bob.address).await;
        assert_eq!(*f.ledger.pending_at_receive.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_withdraw_reply_is_recorded() {
        let f = fixture();
        let alice = f.engine.get_account("alice").await.unwrap();
        f.ledger.fund(&alice.address, 500);
        let reply = PendingReply {
            chat_id: "-100".to_string(),
            message_id: 43,
            text: "Withdrawing...".to_string(),
            text_params: None,
        };

        let hash = f
            .engine
            .withdraw_to_address_with_reply("alice", &outsider(6).0, &Raw::from(7), Some(&reply))
            .await
            .unwrap();

        let tx = f.pending.get(&hash).unwrap().unwrap();
        assert_eq!(tx.action, PendingAction::Withdraw);
        assert_eq!(tx.receiving_user_id, None);
        assert_eq!(tx.chat_id, "-100");
    }
}
