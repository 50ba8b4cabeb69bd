use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::amount::{AmountError, Raw};
use super::crypto::{blake2b_256, Address, CryptoError, DigitalSignature, KeyPair, PublicKey};

/// Hash preamble identifying a state block
const STATE_BLOCK_PREAMBLE: [u8; 32] = {
    let mut preamble = [0u8; 32];
    preamble[31] = 6;
    preamble
};

/// `previous` of an account's first (open) block
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Amount error: {0}")]
    AmountError(#[from] AmountError),

    #[error("Invalid hash field {field}: {value}")]
    InvalidHash { field: &'static str, value: String },
}

/// Subtype of a state block, as reported by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockSubtype {
    Send,
    Receive,
    Open,
    Change,
    Epoch,
    #[serde(other)]
    Unknown,
}

impl BlockSubtype {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockSubtype::Send => "send",
            BlockSubtype::Receive => "receive",
            BlockSubtype::Open => "open",
            BlockSubtype::Change => "change",
            BlockSubtype::Epoch => "epoch",
            BlockSubtype::Unknown => "unknown",
        }
    }
}

fn default_block_type() -> String {
    "state".to_string()
}

/// A Nano state block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Always "state"
    #[serde(rename = "type", default = "default_block_type")]
    pub block_type: String,

    /// The account whose chain this block extends
    pub account: Address,

    /// Hash of the previous block, or all zeros for an open block
    pub previous: String,

    pub representative: Address,

    /// Account balance after this block
    pub balance: Raw,

    /// Destination public key (send) or source block hash (receive)
    pub link: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_as_account: Option<Address>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DigitalSignature>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<String>,

    /// Only present on blocks reported by the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<BlockSubtype>,
}

fn decode_hash(field: &'static str, value: &str) -> Result<[u8; 32], BlockError> {
    hex::decode(value)
        .ok()
        .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
        .ok_or_else(|| BlockError::InvalidHash {
            field,
            value: value.to_string(),
        })
}

impl Block {
    /// Builds and signs a state block
    ///
    /// # Arguments
    ///
    /// * `keys` - The keys of the account the block belongs to
    /// * `previous` - The account frontier, or `None` for an open block
    /// * `representative` - The representative to delegate to
    /// * `balance` - The balance after this block
    /// * `link` - The 32-byte link field
    pub fn new_signed(
        keys: &KeyPair,
        previous: Option<&str>,
        representative: Address,
        balance: Raw,
        link: [u8; 32],
    ) -> Result<(String, Block), BlockError> {
        let mut block = Block {
            block_type: default_block_type(),
            account: keys.address().clone(),
            previous: previous.unwrap_or(ZERO_HASH).to_uppercase(),
            representative,
            balance,
            link: hex::encode_upper(link),
            link_as_account: Some(Address::from_public_key(&PublicKey(link))),
            signature: None,
            work: None,
            subtype: None,
        };

        let hash = block.calculate_hash()?;
        block.signature = Some(keys.sign(&hash));

        Ok((hex::encode_upper(hash), block))
    }

    /// Calculates the block hash
    ///
    /// # Returns
    ///
    /// The Blake2b-256 hash of the block's fields
    pub fn calculate_hash(&self) -> Result<[u8; 32], BlockError> {
        let account = self.account.to_public_key()?;
        let previous = decode_hash("previous", &self.previous)?;
        let representative = self.representative.to_public_key()?;
        let balance = self.balance.to_be_bytes_16()?;
        let link = decode_hash("link", &self.link)?;

        Ok(blake2b_256(&[
            &STATE_BLOCK_PREAMBLE,
            &account.0,
            &previous,
            &representative.0,
            &balance,
            &link,
        ]))
    }

    pub fn is_open(&self) -> bool {
        self.previous == ZERO_HASH
    }
}
