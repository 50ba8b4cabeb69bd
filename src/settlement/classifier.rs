use log::debug;
use serde::Serialize;

use std::str::FromStr;
use std::sync::Arc;

use super::account::{Account, AccountError, AccountRegistry};
use super::amount::Raw;
use super::block::BlockSubtype;
use super::crypto::{Address, PublicKey};
use super::ledger::{Ledger, LedgerError};
use super::pending::PendingTx;
use super::stream::Confirmation;

/// What a confirmed transfer means for the custodial users involved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxAction {
    /// Between two custodial accounts
    Tip,
    /// From a custodial account to the outside
    Withdraw,
    /// From the outside into a custodial account
    TopUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// The send is confirmed, the funds are not yet received
    Pending,
    /// The receive is confirmed
    Confirmed,
}

/// Which side of a transfer a block records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    /// Open blocks are receives; other subtypes carry no transfer
    pub fn of(subtype: BlockSubtype) -> Option<Direction> {
        match subtype {
            BlockSubtype::Send => Some(Direction::Send),
            BlockSubtype::Receive | BlockSubtype::Open => Some(Direction::Receive),
            BlockSubtype::Change | BlockSubtype::Epoch | BlockSubtype::Unknown => None,
        }
    }
}

/// Classifies a transfer by which of its two accounts are custodial
///
/// `account_known` refers to the block's own account and `counterpart_known`
/// to the other party. Transfers touching no custodial account are ignored.
pub fn classify(direction: Direction, account_known: bool, counterpart_known: bool) -> Option<(TxAction, TxStatus)> {
    use Direction::*;
    use TxAction::*;
    use TxStatus::*;

    match (direction, account_known, counterpart_known) {
        (Send, true, true) => Some((Tip, Pending)),
        (Receive, true, true) => Some((Tip, Confirmed)),
        (Send, true, false) => Some((Withdraw, Pending)),
        (Receive, false, true) => Some((Withdraw, Confirmed)),
        (Send, false, true) => Some((TopUp, Pending)),
        (Receive, true, false) => Some((TopUp, Confirmed)),
        (_, false, false) => None,
    }
}

/// A classified confirmation, handed to the confirmation handler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionEvent {
    pub action: TxAction,
    pub status: TxStatus,

    /// Hash of the confirmed block
    pub id: String,

    /// Hash of the send block, which is also the pending tx key
    pub source_hash: String,

    pub amount: Option<Raw>,
    pub sending: Option<Account>,
    pub receiving: Option<Account>,

    /// Filled in for confirmed transfers that were submitted through us
    pub pending_tx: Option<PendingTx>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Account error: {0}")]
    AccountError(#[from] AccountError),

    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
}

/// Resolves the parties of confirmed blocks against the account registry
pub struct Classifier {
    registry: Arc<AccountRegistry>,
    ledger: Arc<dyn Ledger>,
}

impl Classifier {
    pub fn new(registry: Arc<AccountRegistry>, ledger: Arc<dyn Ledger>) -> Self {
        Classifier { registry, ledger }
    }

    /// The destination of a send block
    fn send_destination(confirmation: &Confirmation) -> Option<Address> {
        let block = &confirmation.block;
        block.link_as_account.clone().or_else(|| {
            PublicKey::from_str(&block.link)
                .ok()
                .map(|key| Address::from_public_key(&key))
        })
    }

    /// Classifies a confirmation
    ///
    /// # Returns
    ///
    /// `None` for blocks that are not transfers or involve no custodial account
    pub async fn classify(&self, confirmation: &Confirmation) -> Result<Option<TransactionEvent>, ClassifyError> {
        let block = &confirmation.block;
        let Some(direction) = block.subtype.and_then(Direction::of) else {
            debug!("Skipping {} with subtype {:?}", confirmation.hash, block.subtype);
            return Ok(None);
        };

        let (counterpart, source_hash) = match direction {
            Direction::Send => match Self::send_destination(confirmation) {
                Some(destination) => (destination, confirmation.hash.to_uppercase()),
                None => {
                    debug!("Skipping send {} with unreadable link {}", confirmation.hash, block.link);
                    return Ok(None);
                }
            },
            Direction::Receive => (self.ledger.block_account(&block.link).await?, block.link.to_uppercase()),
        };

        let account = self.registry.get_account_by_address(&block.account)?;
        let counterpart = self.registry.get_account_by_address(&counterpart)?;

        let Some((action, status)) = classify(direction, account.is_some(), counterpart.is_some()) else {
            return Ok(None);
        };

        let (sending, receiving) = match direction {
            Direction::Send => (account, counterpart),
            Direction::Receive => (counterpart, account),
        };

        Ok(Some(TransactionEvent {
            action,
            status,
            id: confirmation.hash.to_uppercase(),
            source_hash,
            amount: confirmation.amount.clone(),
            sending,
            receiving,
            pending_tx: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_table() {
        use Direction::*;
        use TxAction::*;
        use TxStatus::*;

        let cases = [
            (Send, true, true, Some((Tip, Pending))),
            (Receive, true, true, Some((Tip, Confirmed))),
            (Send, true, false, Some((Withdraw, Pending))),
            (Receive, false, true, Some((Withdraw, Confirmed))),
            (Send, false, true, Some((TopUp, Pending))),
            (Receive, true, false, Some((TopUp, Confirmed))),
            (Send, false, false, None),
            (Receive, false, false, None),
        ];

        for (direction, account, counterpart, expected) in cases {
            assert_eq!(classify(direction, account, counterpart), expected, "{:?} {} {}", direction, account, counterpart);
        }
    }

    #[test]
    fn test_direction_of_subtype() {
        assert_eq!(Direction::of(BlockSubtype::Send), Some(Direction::Send));
        assert_eq!(Direction::of(BlockSubtype::Receive), Some(Direction::Receive));
        assert_eq!(Direction::of(BlockSubtype::Open), Some(Direction::Receive));
        assert_eq!(Direction::of(BlockSubtype::Change), None);
        assert_eq!(Direction::of(BlockSubtype::Epoch), None);
    }

    #[test]
    fn test_event_serializes_lowercase() {
        let json = serde_json::to_value((TxAction::TopUp, TxStatus::Confirmed)).unwrap();
        assert_eq!(json, serde_json::json!(["topup", "confirmed"]));
    }
}
